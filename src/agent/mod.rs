//! Agent channel: the transport to each client machine's local agent.
//!
//! The orchestrator only sends commands through [`AgentChannel`]; results
//! come back asynchronously through the result-report API.

mod http;

pub use http::*;

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::db::{ClientMachine, Package};

/// Agent channel error types.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("agent request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("agent rejected command: {0}")]
    Rejected(String),
}

impl ChannelError {
    /// Whether resending the same command may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ChannelError::Rejected(_))
    }
}

/// Package details an agent needs to fetch and verify the artifact.
#[derive(Debug, Clone, Serialize)]
pub struct PackageRef {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub checksum: String,
    pub size: i64,
    pub artifact_ref: String,
}

impl From<&Package> for PackageRef {
    fn from(p: &Package) -> Self {
        Self {
            id: p.id,
            name: p.name.clone(),
            version: p.version.clone(),
            checksum: p.checksum.clone(),
            size: p.size,
            artifact_ref: p.artifact_ref.clone(),
        }
    }
}

/// Install command for one status row.
#[derive(Debug, Clone, Serialize)]
pub struct InstallCommand {
    pub status_id: i64,
    pub deployment_id: i64,
    pub package: PackageRef,
}

/// Best-effort cancellation of an in-flight install.
#[derive(Debug, Clone, Serialize)]
pub struct CancelCommand {
    pub status_id: i64,
    pub deployment_id: i64,
}

/// Command transport to client agents.
///
/// `install` returns once the agent has accepted the command, not when the
/// install finishes.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    async fn install(&self, client: &ClientMachine, command: &InstallCommand) -> Result<(), ChannelError>;

    async fn cancel(&self, client: &ClientMachine, command: &CancelCommand) -> Result<(), ChannelError>;
}
