//! Deployment-wide status derived from per-client rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{ClientMachine, DeploymentDetail, Package, RowState, StatusDetail};

/// Aggregate status of a deployment. Never stored; computed on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// Number of rows in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed + self.cancelled
    }

    fn active(&self) -> usize {
        self.pending + self.in_progress
    }

    /// Fold the counts into the deployment's aggregate status.
    ///
    /// Rules are checked top-down: all cancelled; any failed with nothing
    /// pending or in progress; anything pending or in progress; all completed.
    /// A finished mix of completed and cancelled rows reports `Cancelled`.
    pub fn aggregate(&self) -> AggregateStatus {
        let total = self.total();
        if total > 0 && self.cancelled == total {
            AggregateStatus::Cancelled
        } else if self.failed > 0 && self.active() == 0 {
            AggregateStatus::Failed
        } else if self.active() > 0 {
            AggregateStatus::InProgress
        } else if self.completed == total {
            AggregateStatus::Completed
        } else {
            AggregateStatus::Cancelled
        }
    }
}

impl FromIterator<RowState> for StatusCounts {
    fn from_iter<I: IntoIterator<Item = RowState>>(iter: I) -> Self {
        let mut counts = StatusCounts::default();
        for state in iter {
            match state {
                RowState::Pending => counts.pending += 1,
                RowState::InProgress => counts.in_progress += 1,
                RowState::Completed => counts.completed += 1,
                RowState::Failed => counts.failed += 1,
                RowState::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }
}

/// A status row as returned to API consumers, with its client embedded.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub id: i64,
    pub client: ClientMachine,
    pub status: RowState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub log_output: String,
}

impl From<StatusDetail> for StatusView {
    fn from(detail: StatusDetail) -> Self {
        let StatusDetail { status, client } = detail;
        Self {
            id: status.id,
            client,
            status: status.state,
            started_at: status.started_at,
            completed_at: status.completed_at,
            error_message: status.error_message,
            log_output: status.log_output,
        }
    }
}

/// A deployment with its package, rows and computed aggregate status.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentView {
    pub id: i64,
    pub package: Package,
    pub clients: Vec<i64>,
    pub description: String,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub status: AggregateStatus,
    pub counts: StatusCounts,
    pub deployment_statuses: Vec<StatusView>,
}

impl From<DeploymentDetail> for DeploymentView {
    fn from(detail: DeploymentDetail) -> Self {
        let counts: StatusCounts = detail.statuses.iter().map(|s| s.status.state).collect();
        let deployment = detail.deployment;
        Self {
            id: deployment.id,
            package: detail.package,
            clients: deployment.client_ids,
            description: deployment.description,
            created_by: deployment.created_by,
            created_at: deployment.created_at,
            scheduled_for: deployment.scheduled_for,
            status: counts.aggregate(),
            counts,
            deployment_statuses: detail.statuses.into_iter().map(StatusView::from).collect(),
        }
    }
}
