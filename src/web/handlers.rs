//! HTTP request handlers.

use super::{upload, ApiError, AppState, Operator};
use crate::db::{
    ClientFilter, ClientMachine, ClientStatus, DeploymentFilter, DeploymentStatus, NewClient,
    OsCompatibility, OsType, Package, PackageFilter, RowState, StatusFilter,
};
use crate::orchestrator::{
    AggregateStatus, CreateDeployment, DeploymentQuery, DeploymentView, OrchestratorError, Outcome,
};

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    Extension,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

type ApiResult<T> = Result<Json<T>, ApiError>;

fn not_found(what: &str, id: i64) -> impl Fn(ApiError) -> ApiError + '_ {
    move |e| match e {
        ApiError::NotFound(_) => ApiError::NotFound(format!("{} {}", what, id)),
        other => other,
    }
}

// ============================================================================
// API: Clients
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ClientParams {
    pub status: Option<ClientStatus>,
    pub os_type: Option<OsType>,
    pub search: Option<String>,
}

pub async fn handle_get_clients(
    State(state): State<AppState>,
    Query(params): Query<ClientParams>,
) -> ApiResult<Vec<ClientMachine>> {
    let filter = ClientFilter {
        status: params.status,
        os_type: params.os_type,
        search: params.search,
    };
    Ok(Json(state.registry.list(&filter)?))
}

pub async fn handle_create_client(
    State(state): State<AppState>,
    Json(req): Json<NewClient>,
) -> Result<impl IntoResponse, ApiError> {
    let client = state.registry.register(req)?;
    Ok((StatusCode::CREATED, Json(client)))
}

pub async fn handle_get_client(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<ClientMachine> {
    let client = state
        .registry
        .resolve(id)
        .map_err(ApiError::from)
        .map_err(not_found("client", id))?;
    Ok(Json(client))
}

pub async fn handle_client_checkin(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<ClientMachine> {
    let client = state
        .registry
        .check_in(id)
        .map_err(ApiError::from)
        .map_err(not_found("client", id))?;
    Ok(Json(client))
}

#[derive(Debug, Deserialize)]
pub struct UpdateClientStatusRequest {
    pub status: String,
}

pub async fn handle_update_client_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateClientStatusRequest>,
) -> ApiResult<ClientMachine> {
    let status = ClientStatus::parse(req.status.trim()).ok_or_else(|| {
        ApiError::BadRequest(format!(
            "invalid status {:?}, expected one of online, offline, error",
            req.status
        ))
    })?;
    let client = state
        .registry
        .set_status(id, status)
        .map_err(ApiError::from)
        .map_err(not_found("client", id))?;
    Ok(Json(client))
}

// ============================================================================
// API: Packages
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct PackageParams {
    pub os_compatibility: Option<OsCompatibility>,
    pub is_active: Option<bool>,
    pub search: Option<String>,
}

pub async fn handle_get_packages(
    State(state): State<AppState>,
    Query(params): Query<PackageParams>,
) -> ApiResult<Vec<Package>> {
    let filter = PackageFilter {
        os_compatibility: params.os_compatibility,
        is_active: params.is_active,
        search: params.search,
    };
    Ok(Json(state.store.get_packages(&filter)?))
}

pub async fn handle_upload_package(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let form = upload::UploadForm::read(multipart, &state.config.artifact_dir).await?;
    let package = upload::save_package(&state.store, &state.config.artifact_dir, form).await?;
    Ok((StatusCode::CREATED, Json(package)))
}

pub async fn handle_get_package(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Package> {
    let package = state
        .store
        .get_package(id)
        .map_err(ApiError::from)
        .map_err(not_found("package", id))?;
    Ok(Json(package))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePackageRequest {
    pub is_active: bool,
}

pub async fn handle_update_package(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdatePackageRequest>,
) -> ApiResult<Package> {
    let package = state
        .store
        .set_package_active(id, req.is_active)
        .map_err(ApiError::from)
        .map_err(not_found("package", id))?;
    tracing::info!(package_id = id, "Package active = {}", package.is_active);
    Ok(Json(package))
}

// ============================================================================
// API: Deployments
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct DeploymentParams {
    pub package: Option<i64>,
    pub client: Option<i64>,
    pub created_by: Option<String>,
    pub status: Option<AggregateStatus>,
    pub search: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub async fn handle_get_deployments(
    State(state): State<AppState>,
    Query(params): Query<DeploymentParams>,
) -> ApiResult<Vec<DeploymentView>> {
    let query = DeploymentQuery {
        filter: DeploymentFilter {
            package_id: params.package,
            client_id: params.client,
            created_by: params.created_by,
            search: params.search,
            limit: params.limit,
            offset: params.offset,
        },
        status: params.status,
    };
    Ok(Json(state.orchestrator.list_deployments(&query)?))
}

#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    pub package: i64,
    pub clients: Vec<i64>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

pub async fn handle_create_deployment(
    State(state): State<AppState>,
    Extension(Operator(operator)): Extension<Operator>,
    Json(req): Json<CreateDeploymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state
        .orchestrator
        .create_deployment(CreateDeployment {
            package_id: req.package,
            client_ids: req.clients,
            description: req.description,
            created_by: operator,
            scheduled_for: req.scheduled_for,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn handle_get_deployment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<DeploymentView> {
    Ok(Json(state.orchestrator.get_deployment(id)?))
}

pub async fn handle_cancel_deployment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<DeploymentView> {
    Ok(Json(state.orchestrator.cancel_deployment(id).await?))
}

pub async fn handle_retry_failed(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<DeploymentView> {
    Ok(Json(state.orchestrator.retry_failed(id).await?))
}

// ============================================================================
// API: Deployment status rows
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct StatusParams {
    pub deployment: Option<i64>,
    pub client: Option<i64>,
    pub status: Option<RowState>,
}

pub async fn handle_get_statuses(
    State(state): State<AppState>,
    Query(params): Query<StatusParams>,
) -> ApiResult<Vec<DeploymentStatus>> {
    let filter = StatusFilter {
        deployment_id: params.deployment,
        client_id: params.client,
        state: params.status,
    };
    Ok(Json(state.store.find_statuses(&filter)?))
}

pub async fn handle_get_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<DeploymentStatus> {
    let status = state
        .store
        .get_status(id)
        .map_err(ApiError::from)
        .map_err(not_found("status", id))?;
    Ok(Json(status))
}

#[derive(Debug, Serialize)]
pub struct ReportResponse {
    /// False when the row was already terminal and the result was discarded.
    pub applied: bool,
    pub status: RowState,
}

/// Agent callback with the outcome of one install.
pub async fn handle_report_result(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(outcome): Json<Outcome>,
) -> ApiResult<ReportResponse> {
    match state.orchestrator.report_status_result(id, outcome) {
        Ok(row) => Ok(Json(ReportResponse {
            applied: true,
            status: row.state,
        })),
        Err(OrchestratorError::State { current, .. }) => Ok(Json(ReportResponse {
            applied: false,
            status: current,
        })),
        Err(e) => Err(e.into()),
    }
}
