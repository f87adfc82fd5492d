//! Configuration module for fleetdeploy.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "fleetdeploy.db")
    pub db_path: String,
    /// Directory uploaded package artifacts are written to (default: "artifacts")
    pub artifact_dir: String,
    /// Base URL agents use to report results back (default: http://127.0.0.1:<port>)
    pub public_url: String,
    /// Bearer tokens accepted by the API, keyed by token, valued by operator name.
    /// Empty disables authentication.
    pub api_tokens: HashMap<String, String>,
    pub scheduler: SchedulerConfig,
    pub dispatch: DispatchConfig,
    pub agent: AgentConfig,
}

/// Timing of the background passes.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between scheduler ticks (default: 10s)
    pub interval: Duration,
    /// Rows left in_progress longer than this are failed with "timeout" (default: 30m)
    pub dispatch_timeout: Duration,
    /// Online clients not seen for this long are marked offline (default: 3m)
    pub client_offline_after: Duration,
}

/// Delivery policy at the dispatch boundary.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Attempts per delivery before the row is recorded as failed (default: 3)
    pub max_attempts: u32,
    /// Base backoff, doubled after each failed attempt (default: 500ms)
    pub backoff: Duration,
    /// Record known-offline targets as failed instead of dispatching (default: true)
    pub skip_offline: bool,
}

/// Client agent endpoint settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Port the client agent listens on (default: 8765)
    pub port: u16,
    /// Per-request timeout (default: 10s)
    pub timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            dispatch_timeout: Duration::from_secs(1800),
            client_offline_after: Duration::from_secs(180),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
            skip_offline: true,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: 8765,
            timeout: Duration::from_secs(10),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "fleetdeploy.db".to_string(),
            artifact_dir: "artifacts".to_string(),
            public_url: "http://127.0.0.1:8080".to_string(),
            api_tokens: HashMap::new(),
            scheduler: SchedulerConfig::default(),
            dispatch: DispatchConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `FLEETDEPLOY_HTTP_PORT`: HTTP port (default: 8080)
    /// - `FLEETDEPLOY_DB_PATH`: Database file path (default: "fleetdeploy.db")
    /// - `FLEETDEPLOY_ARTIFACT_DIR`: Package artifact directory (default: "artifacts")
    /// - `FLEETDEPLOY_PUBLIC_URL`: Result callback base URL
    /// - `FLEETDEPLOY_API_TOKENS`: `name:token` pairs, comma separated
    /// - `FLEETDEPLOY_SCHEDULER_INTERVAL_SECS`, `FLEETDEPLOY_DISPATCH_TIMEOUT_SECS`,
    ///   `FLEETDEPLOY_CLIENT_OFFLINE_AFTER_SECS`
    /// - `FLEETDEPLOY_DISPATCH_MAX_ATTEMPTS`, `FLEETDEPLOY_DISPATCH_BACKOFF_MS`,
    ///   `FLEETDEPLOY_SKIP_OFFLINE`
    /// - `FLEETDEPLOY_AGENT_PORT`, `FLEETDEPLOY_AGENT_TIMEOUT_SECS`
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(port) = parse_var("FLEETDEPLOY_HTTP_PORT") {
            cfg.http_port = port;
        }
        cfg.public_url = format!("http://127.0.0.1:{}", cfg.http_port);

        if let Ok(db_path) = env::var("FLEETDEPLOY_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Ok(dir) = env::var("FLEETDEPLOY_ARTIFACT_DIR") {
            cfg.artifact_dir = dir;
        }
        if let Ok(url) = env::var("FLEETDEPLOY_PUBLIC_URL") {
            cfg.public_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(tokens) = env::var("FLEETDEPLOY_API_TOKENS") {
            cfg.api_tokens = parse_tokens(&tokens);
        }

        if let Some(secs) = parse_var("FLEETDEPLOY_SCHEDULER_INTERVAL_SECS") {
            cfg.scheduler.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var("FLEETDEPLOY_DISPATCH_TIMEOUT_SECS") {
            cfg.scheduler.dispatch_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var("FLEETDEPLOY_CLIENT_OFFLINE_AFTER_SECS") {
            cfg.scheduler.client_offline_after = Duration::from_secs(secs);
        }

        if let Some(attempts) = parse_var::<u32>("FLEETDEPLOY_DISPATCH_MAX_ATTEMPTS") {
            cfg.dispatch.max_attempts = attempts.max(1);
        }
        if let Some(ms) = parse_var("FLEETDEPLOY_DISPATCH_BACKOFF_MS") {
            cfg.dispatch.backoff = Duration::from_millis(ms);
        }
        if let Some(skip) = parse_var("FLEETDEPLOY_SKIP_OFFLINE") {
            cfg.dispatch.skip_offline = skip;
        }

        if let Some(port) = parse_var("FLEETDEPLOY_AGENT_PORT") {
            cfg.agent.port = port;
        }
        if let Some(secs) = parse_var("FLEETDEPLOY_AGENT_TIMEOUT_SECS") {
            cfg.agent.timeout = Duration::from_secs(secs);
        }

        cfg
    }

    /// Whether API requests must carry a bearer token.
    pub fn auth_enabled(&self) -> bool {
        !self.api_tokens.is_empty()
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {}: {:?}", name, raw);
            None
        }
    }
}

/// Parse `name:token,name2:token2` into a token -> name map.
/// Entries without a name use the token itself as the operator name.
fn parse_tokens(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((name, token)) => (token.trim().to_string(), name.trim().to_string()),
            None => (entry.to_string(), entry.to_string()),
        })
        .filter(|(token, _)| !token.is_empty())
        .collect()
}
