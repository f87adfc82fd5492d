//! Bearer-token authentication.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::{ApiError, AppState};

/// Name of the operator behind the request's token. `None` when
/// authentication is disabled.
#[derive(Debug, Clone)]
pub struct Operator(pub Option<String>);

/// Resolve the `Authorization` header to an operator or reject with 401.
/// Accepts `Bearer <token>` and `Token <token>`.
pub async fn require_token(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    if !state.config.auth_enabled() {
        req.extensions_mut().insert(Operator(None));
        return next.run(req).await;
    }

    let operator = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer ").or_else(|| h.strip_prefix("Token ")))
        .and_then(|token| state.config.api_tokens.get(token.trim()))
        .cloned();

    match operator {
        Some(name) => {
            tracing::debug!(operator = %name, "Authenticated request");
            req.extensions_mut().insert(Operator(Some(name)));
            next.run(req).await
        }
        None => {
            tracing::debug!("Missing or unknown API token");
            ApiError::Unauthorized.into_response()
        }
    }
}
