//! Deployment orchestration.
//!
//! Accepts deployment requests, fans install commands out to every target
//! client, applies results as they arrive, and supports cancel and
//! retry-failed. All row mutations are compare-and-set transitions in the
//! store, so operator requests, scheduler ticks and agent callbacks may run
//! concurrently against the same deployment.

mod aggregate;
mod delivery;

pub use aggregate::*;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::agent::{AgentChannel, CancelCommand, InstallCommand, PackageRef};
use crate::config::DispatchConfig;
use crate::db::{
    DbError, DeploymentFilter, DeploymentStatus, NewDeployment, RowState, Store, Transition,
};
use crate::registry::ClientRegistry;

/// Orchestrator error types.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Bad input; nothing was created.
    #[error("validation error: {0}")]
    Validation(String),
    /// A result arrived for a row that can no longer transition.
    #[error("status {status_id} is already {current}")]
    State { status_id: i64, current: RowState },
    #[error("deployment {0} has no failed rows to retry")]
    NoRetryableRows(i64),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(DbError),
}

impl From<DbError> for OrchestratorError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Conflict { status_id, current } => OrchestratorError::State { status_id, current },
            other => OrchestratorError::Store(other),
        }
    }
}

/// Result of one install attempt as reported by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        #[serde(default)]
        log_output: String,
    },
    Failure {
        error_message: String,
        #[serde(default)]
        log_output: String,
    },
}

impl Outcome {
    pub fn failure(error_message: impl Into<String>) -> Self {
        Outcome::Failure {
            error_message: error_message.into(),
            log_output: String::new(),
        }
    }
}

/// Operator request to create a deployment.
#[derive(Debug, Clone)]
pub struct CreateDeployment {
    pub package_id: i64,
    pub client_ids: Vec<i64>,
    pub description: String,
    pub created_by: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Listing criteria: store-level filters plus the derived aggregate status.
#[derive(Debug, Clone, Default)]
pub struct DeploymentQuery {
    pub filter: DeploymentFilter,
    pub status: Option<AggregateStatus>,
}

/// Largest page returned when listing by aggregate status.
pub const MAX_STATUS_PAGE: usize = 500;

const STATUS_SCAN_BATCH: u32 = 100;

/// The orchestration engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<Store>,
    registry: ClientRegistry,
    channel: Arc<dyn AgentChannel>,
    policy: DispatchConfig,
}

/// Timestamped line for a row's `log_output`.
pub(crate) fn log_line(message: &str) -> String {
    format!("[{}] {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"), message)
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        registry: ClientRegistry,
        channel: Arc<dyn AgentChannel>,
        policy: DispatchConfig,
    ) -> Self {
        Self {
            store,
            registry,
            channel,
            policy,
        }
    }

    /// Validate and persist a deployment with one pending row per client.
    /// Unscheduled or already-due deployments are dispatched immediately.
    pub async fn create_deployment(
        &self,
        request: CreateDeployment,
    ) -> Result<DeploymentView, OrchestratorError> {
        self.validate(&request)?;

        let now = Utc::now();
        let deployment = self.store.create_deployment_with_statuses(
            &NewDeployment {
                package_id: request.package_id,
                client_ids: request.client_ids,
                description: request.description,
                created_by: request.created_by,
                scheduled_for: request.scheduled_for,
            },
            now,
        )?;

        tracing::info!(
            deployment_id = deployment.id,
            package_id = deployment.package_id,
            "Created deployment for {} clients",
            deployment.client_ids.len()
        );

        if deployment.is_due(now) {
            self.dispatch_at(deployment.id, now).await?;
        } else if let Some(at) = deployment.scheduled_for {
            tracing::info!(deployment_id = deployment.id, "Deployment scheduled for {}", at);
        }

        self.get_deployment(deployment.id)
    }

    fn validate(&self, request: &CreateDeployment) -> Result<(), OrchestratorError> {
        if request.client_ids.is_empty() {
            return Err(OrchestratorError::Validation(
                "at least one client is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = request.client_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(OrchestratorError::Validation(format!(
                "client {} listed more than once",
                dup
            )));
        }

        let package = match self.store.get_package(request.package_id) {
            Ok(p) => p,
            Err(DbError::NotFound) => {
                return Err(OrchestratorError::Validation(format!(
                    "unknown package {}",
                    request.package_id
                )))
            }
            Err(e) => return Err(e.into()),
        };
        if !package.is_active {
            return Err(OrchestratorError::Validation(format!(
                "package {} {} is not active",
                package.name, package.version
            )));
        }

        for id in &request.client_ids {
            let client = match self.registry.resolve(*id) {
                Ok(c) => c,
                Err(DbError::NotFound) => {
                    return Err(OrchestratorError::Validation(format!("unknown client {}", id)))
                }
                Err(e) => return Err(e.into()),
            };
            if !package.os_compatibility.supports(client.os_type) {
                return Err(OrchestratorError::Validation(format!(
                    "package {} {} targets {}, client {} runs {}",
                    package.name, package.version, package.os_compatibility, client.hostname, client.os_type
                )));
            }
        }

        Ok(())
    }

    /// Dispatch every pending row of a deployment whose schedule has arrived.
    pub async fn dispatch(&self, deployment_id: i64) -> Result<usize, OrchestratorError> {
        self.dispatch_at(deployment_id, Utc::now()).await
    }

    /// Move each pending row to in_progress and send its install command.
    ///
    /// Rows another caller already moved are skipped, so concurrent or
    /// repeated dispatch never sends a command twice. Commands are sent from
    /// independent tasks; nothing here waits for installs. Returns the number
    /// of rows dispatched.
    pub async fn dispatch_at(
        &self,
        deployment_id: i64,
        now: DateTime<Utc>,
    ) -> Result<usize, OrchestratorError> {
        let detail = self.detail(deployment_id)?;
        if !detail.deployment.is_due(now) {
            tracing::debug!(deployment_id, "Deployment not due yet, skipping dispatch");
            return Ok(0);
        }

        let package = PackageRef::from(&detail.package);
        let mut dispatched = 0;

        for row in detail.statuses {
            if row.status.state != RowState::Pending {
                continue;
            }
            let status_id = row.status.id;

            if self.policy.skip_offline && !self.registry.is_reachable(&row.client) {
                let transition = Transition::Abort {
                    error: "client offline".to_string(),
                    log: log_line(&format!("{} is offline, install not sent", row.client.hostname)),
                };
                match self.store.apply_transition(status_id, &transition, now) {
                    Ok(_) => tracing::warn!(
                        deployment_id,
                        status_id,
                        "Client {} offline, row failed without dispatch",
                        row.client.hostname
                    ),
                    Err(DbError::Conflict { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
                continue;
            }

            let transition = Transition::Start {
                log: log_line(&format!(
                    "Dispatching {} {} to {}",
                    package.name, package.version, row.client.hostname
                )),
            };
            let started = delivery::store_with_retry(&self.policy, "start row", || {
                self.store.apply_transition(status_id, &transition, now)
            })
            .await;

            match started {
                Ok(_) => {}
                Err(DbError::Conflict { .. }) => continue,
                Err(e) => {
                    tracing::error!(deployment_id, status_id, "Could not start row: {}", e);
                    let failed = Transition::Abort {
                        error: e.to_string(),
                        log: log_line(&format!("Dispatch failed: {}", e)),
                    };
                    if let Err(e) = self.store.apply_transition(status_id, &failed, now) {
                        tracing::error!(status_id, "Row left pending for next tick: {}", e);
                    }
                    continue;
                }
            }

            let command = InstallCommand {
                status_id,
                deployment_id,
                package: package.clone(),
            };
            tokio::spawn(delivery::deliver_install(self.clone(), row.client, command));
            dispatched += 1;
        }

        if dispatched > 0 {
            tracing::info!(deployment_id, "Dispatched {} install commands", dispatched);
        }
        Ok(dispatched)
    }

    /// Apply an agent result for the (deployment, client) row.
    pub fn report_result(
        &self,
        deployment_id: i64,
        client_id: i64,
        outcome: Outcome,
    ) -> Result<DeploymentStatus, OrchestratorError> {
        let row = match self.store.get_status_for_client(deployment_id, client_id) {
            Ok(row) => row,
            Err(DbError::NotFound) => {
                return Err(OrchestratorError::NotFound(format!(
                    "client {} in deployment {}",
                    client_id, deployment_id
                )))
            }
            Err(e) => return Err(e.into()),
        };
        self.report_status_result(row.id, outcome)
    }

    /// Apply an agent result to a status row.
    ///
    /// Only rows in progress accept a result. Results for rows that were
    /// never dispatched, were reset for retry, or are already terminal
    /// (duplicates, late results for cancelled rows) are logged and rejected
    /// with [`OrchestratorError::State`]; the row is unchanged.
    pub fn report_status_result(
        &self,
        status_id: i64,
        outcome: Outcome,
    ) -> Result<DeploymentStatus, OrchestratorError> {
        let transition = match outcome {
            Outcome::Success { log_output } => Transition::Complete {
                log: with_agent_log(log_output, "Installation completed"),
            },
            Outcome::Failure {
                error_message,
                log_output,
            } => Transition::Fail {
                log: with_agent_log(log_output, &format!("Installation failed: {}", error_message)),
                error: error_message,
            },
        };

        match self.store.apply_transition(status_id, &transition, Utc::now()) {
            Ok(row) => {
                tracing::info!(
                    deployment_id = row.deployment_id,
                    status_id,
                    client_id = row.client_id,
                    "Row is now {}",
                    row.state
                );
                Ok(row)
            }
            Err(DbError::NotFound) => Err(OrchestratorError::NotFound(format!("status {}", status_id))),
            Err(DbError::Conflict { current, .. }) => {
                tracing::warn!(status_id, "Discarding result for row already {}", current);
                Err(OrchestratorError::State { status_id, current })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Cancel every pending or in-progress row of a deployment.
    ///
    /// Cancelled rows are terminal immediately. A row the cancel took out of
    /// in_progress also gets a best-effort cancel signal, including one a
    /// concurrent dispatch started after the snapshot. Nothing cancellable
    /// is not an error.
    pub async fn cancel_deployment(&self, deployment_id: i64) -> Result<DeploymentView, OrchestratorError> {
        let detail = self.detail(deployment_id)?;
        let now = Utc::now();
        let mut cancelled = 0;

        for row in detail.statuses {
            if !row.status.state.is_active() {
                continue;
            }
            let transition = Transition::Cancel {
                log: log_line("Cancelled by operator"),
            };

            let previous = match self.store.transition_status(row.status.id, &transition, now) {
                Ok(applied) => applied.previous,
                Err(DbError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            };
            cancelled += 1;

            if previous == RowState::InProgress {
                let command = CancelCommand {
                    status_id: row.status.id,
                    deployment_id,
                };
                tokio::spawn(delivery::send_cancel(self.clone(), row.client, command));
            }
        }

        tracing::info!(deployment_id, "Cancelled {} rows", cancelled);
        self.get_deployment(deployment_id)
    }

    /// Reset every failed row to pending and dispatch it again.
    pub async fn retry_failed(&self, deployment_id: i64) -> Result<DeploymentView, OrchestratorError> {
        let rows = self.detail(deployment_id)?.statuses;
        let failed: Vec<_> = rows
            .iter()
            .filter(|r| r.status.state == RowState::Failed)
            .collect();
        if failed.is_empty() {
            return Err(OrchestratorError::NoRetryableRows(deployment_id));
        }

        let now = Utc::now();
        let mut reset = 0;
        for row in failed {
            let transition = Transition::Reset {
                log: log_line("Retry requested"),
            };
            match self.store.apply_transition(row.status.id, &transition, now) {
                Ok(_) => reset += 1,
                Err(DbError::Conflict { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if reset == 0 {
            return Err(OrchestratorError::NoRetryableRows(deployment_id));
        }

        tracing::info!(deployment_id, "Retrying {} failed rows", reset);
        self.dispatch_at(deployment_id, now).await?;
        self.get_deployment(deployment_id)
    }

    pub fn get_deployment(&self, deployment_id: i64) -> Result<DeploymentView, OrchestratorError> {
        Ok(self.detail(deployment_id)?.into())
    }

    /// List deployments, newest first. Paging applies after the aggregate
    /// status filter, and a status-filtered page holds at most
    /// [`MAX_STATUS_PAGE`] deployments.
    pub fn list_deployments(&self, query: &DeploymentQuery) -> Result<Vec<DeploymentView>, OrchestratorError> {
        let Some(status) = query.status else {
            let views = self.store.list_deployment_details(&query.filter)?;
            return Ok(views.into_iter().map(DeploymentView::from).collect());
        };

        let offset = query.filter.offset.unwrap_or(0) as usize;
        let limit = status_page_limit(query.filter.limit);
        let wanted = offset + limit;

        // The aggregate is derived, so scan newest first until the page is full.
        let mut matched = Vec::new();
        let mut scanned = 0u32;
        loop {
            let batch = self.store.list_deployment_details(&DeploymentFilter {
                limit: Some(STATUS_SCAN_BATCH),
                offset: Some(scanned),
                ..query.filter.clone()
            })?;
            let fetched = batch.len();
            matched.extend(
                batch
                    .into_iter()
                    .map(DeploymentView::from)
                    .filter(|v| v.status == status),
            );
            if matched.len() >= wanted || fetched < STATUS_SCAN_BATCH as usize {
                break;
            }
            scanned += STATUS_SCAN_BATCH;
        }

        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    fn detail(&self, deployment_id: i64) -> Result<crate::db::DeploymentDetail, OrchestratorError> {
        match self.store.get_deployment_detail(deployment_id) {
            Ok(d) => Ok(d),
            Err(DbError::NotFound) => Err(OrchestratorError::NotFound(format!(
                "deployment {}",
                deployment_id
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

fn status_page_limit(requested: Option<u32>) -> usize {
    requested.map_or(MAX_STATUS_PAGE, |l| (l as usize).min(MAX_STATUS_PAGE))
}

fn with_agent_log(agent_log: String, summary: &str) -> String {
    let mut log = agent_log;
    if !log.is_empty() && !log.ends_with('\n') {
        log.push('\n');
    }
    log.push_str(&log_line(summary));
    log
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::RecordingChannel;
    use crate::db::fixtures::*;
    use crate::db::{ClientMachine, ClientStatus, NewClient, OsCompatibility, OsType, Package};
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    struct Harness {
        _tmp: NamedTempFile,
        store: Arc<Store>,
        channel: Arc<RecordingChannel>,
        orch: Orchestrator,
    }

    fn harness_with(channel: RecordingChannel) -> Harness {
        let (tmp, store) = temp_store();
        let store = Arc::new(store);
        let channel = Arc::new(channel);
        let registry = ClientRegistry::new(store.clone(), Duration::from_secs(180));
        let policy = DispatchConfig {
            max_attempts: 3,
            backoff: Duration::ZERO,
            skip_offline: true,
        };
        let orch = Orchestrator::new(store.clone(), registry, channel.clone(), policy);
        Harness {
            _tmp: tmp,
            store,
            channel,
            orch,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingChannel::default())
    }

    fn request(pkg: &Package, clients: &[&ClientMachine]) -> CreateDeployment {
        CreateDeployment {
            package_id: pkg.id,
            client_ids: clients.iter().map(|c| c.id).collect(),
            description: "rollout".to_string(),
            created_by: Some("alice".to_string()),
            scheduled_for: None,
        }
    }

    fn state_of(view: &DeploymentView, client: &ClientMachine) -> RowState {
        view.deployment_statuses
            .iter()
            .find(|s| s.client.id == client.id)
            .map(|s| s.status)
            .unwrap()
    }

    #[tokio::test]
    async fn test_three_client_scenario() {
        let h = harness();
        let a = linux_client(&h.store, "a");
        let b = linux_client(&h.store, "b");
        let c = linux_client(&h.store, "c");
        let pkg = package(&h.store, "agent", OsCompatibility::Linux);

        let view = h
            .orch
            .create_deployment(request(&pkg, &[&a, &b, &c]))
            .await
            .unwrap();
        assert_eq!(view.deployment_statuses.len(), 3);
        assert!(view
            .deployment_statuses
            .iter()
            .all(|s| s.status == RowState::InProgress && s.started_at.is_some()));
        h.channel.wait_for_installs(3).await;

        h.orch
            .report_result(view.id, a.id, Outcome::Success { log_output: "ok".to_string() })
            .unwrap();
        h.orch
            .report_result(view.id, b.id, Outcome::failure("disk full"))
            .unwrap();
        assert_eq!(h.orch.get_deployment(view.id).unwrap().status, AggregateStatus::InProgress);

        h.orch
            .report_result(view.id, c.id, Outcome::Success { log_output: String::new() })
            .unwrap();
        let view = h.orch.get_deployment(view.id).unwrap();
        assert_eq!(view.status, AggregateStatus::Failed);
        let b_row = view.deployment_statuses.iter().find(|s| s.client.id == b.id).unwrap();
        assert_eq!(b_row.error_message.as_deref(), Some("disk full"));

        let view = h.orch.retry_failed(view.id).await.unwrap();
        assert_eq!(state_of(&view, &b), RowState::InProgress);
        assert_eq!(state_of(&view, &a), RowState::Completed);
        assert_eq!(view.status, AggregateStatus::InProgress);
        h.channel.wait_for_installs(4).await;
        assert_eq!(h.channel.installed_clients().last(), Some(&b.id));

        h.orch
            .report_result(view.id, b.id, Outcome::Success { log_output: String::new() })
            .unwrap();
        assert_eq!(h.orch.get_deployment(view.id).unwrap().status, AggregateStatus::Completed);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let h = harness();
        let linux = linux_client(&h.store, "lin");
        let win = h
            .store
            .add_client(
                &NewClient {
                    hostname: "win".to_string(),
                    ip_address: "10.0.0.9".to_string(),
                    os_type: OsType::Windows,
                    os_version: "11".to_string(),
                },
                Utc::now(),
            )
            .unwrap();
        let pkg = package(&h.store, "agent", OsCompatibility::Linux);

        let cases = vec![
            CreateDeployment {
                client_ids: vec![],
                ..request(&pkg, &[])
            },
            CreateDeployment {
                package_id: 999,
                ..request(&pkg, &[&linux])
            },
            CreateDeployment {
                client_ids: vec![linux.id, 424242],
                ..request(&pkg, &[])
            },
            request(&pkg, &[&linux, &win]),
            request(&pkg, &[&linux, &linux]),
        ];
        for case in cases {
            let err = h.orch.create_deployment(case).await.unwrap_err();
            assert!(matches!(err, OrchestratorError::Validation(_)), "{:?}", err);
        }

        h.store.set_package_active(pkg.id, false).unwrap();
        let err = h.orch.create_deployment(request(&pkg, &[&linux])).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));

        assert!(h
            .orch
            .list_deployments(&DeploymentQuery::default())
            .unwrap()
            .is_empty());
        assert_eq!(h.channel.install_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_result_is_ignored() {
        let h = harness();
        let a = linux_client(&h.store, "a");
        let pkg = package(&h.store, "agent", OsCompatibility::All);
        let view = h.orch.create_deployment(request(&pkg, &[&a])).await.unwrap();
        let status_id = view.deployment_statuses[0].id;

        let first = h
            .orch
            .report_status_result(status_id, Outcome::Success { log_output: String::new() })
            .unwrap();
        let err = h
            .orch
            .report_status_result(status_id, Outcome::failure("late"))
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::State {
                current: RowState::Completed,
                ..
            }
        ));

        let row = h.store.get_status(status_id).unwrap();
        assert_eq!(row.state, RowState::Completed);
        assert_eq!(row.completed_at, first.completed_at);
        assert_eq!(row.log_output, first.log_output);
    }

    #[tokio::test]
    async fn test_cancel_completed_deployment_is_noop() {
        let h = harness();
        let a = linux_client(&h.store, "a");
        let pkg = package(&h.store, "agent", OsCompatibility::All);
        let view = h.orch.create_deployment(request(&pkg, &[&a])).await.unwrap();
        h.orch
            .report_result(view.id, a.id, Outcome::Success { log_output: String::new() })
            .unwrap();

        let view = h.orch.cancel_deployment(view.id).await.unwrap();
        assert_eq!(view.status, AggregateStatus::Completed);
        assert_eq!(state_of(&view, &a), RowState::Completed);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.channel.cancel_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_discards_late_results() {
        let h = harness();
        let a = linux_client(&h.store, "a");
        let b = linux_client(&h.store, "b");
        let pkg = package(&h.store, "agent", OsCompatibility::All);
        let view = h.orch.create_deployment(request(&pkg, &[&a, &b])).await.unwrap();
        h.orch
            .report_result(view.id, a.id, Outcome::Success { log_output: String::new() })
            .unwrap();

        let view = h.orch.cancel_deployment(view.id).await.unwrap();
        assert_eq!(state_of(&view, &a), RowState::Completed);
        assert_eq!(state_of(&view, &b), RowState::Cancelled);
        assert_eq!(view.status, AggregateStatus::Cancelled);
        h.channel.wait_for_cancels(1).await;
        assert_eq!(h.channel.cancels.lock().unwrap()[0].0, b.id);

        let late = h
            .orch
            .report_result(view.id, b.id, Outcome::Success { log_output: String::new() });
        assert!(matches!(late, Err(OrchestratorError::State { .. })));
        assert_eq!(
            h.store.get_status_for_client(view.id, b.id).unwrap().state,
            RowState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_retry_without_failed_rows() {
        let h = harness();
        let a = linux_client(&h.store, "a");
        let pkg = package(&h.store, "agent", OsCompatibility::All);
        let view = h.orch.create_deployment(request(&pkg, &[&a])).await.unwrap();
        let before = h.store.get_statuses(view.id).unwrap();

        let err = h.orch.retry_failed(view.id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NoRetryableRows(id) if id == view.id));

        let after = h.store.get_statuses(view.id).unwrap();
        assert_eq!(before[0].state, after[0].state);
        assert_eq!(before[0].started_at, after[0].started_at);
        assert_eq!(before[0].log_output, after[0].log_output);
    }

    #[tokio::test]
    async fn test_scheduled_deployment_waits() {
        let h = harness();
        let a = linux_client(&h.store, "a");
        let pkg = package(&h.store, "agent", OsCompatibility::All);
        let at = Utc::now() + ChronoDuration::hours(1);

        let view = h
            .orch
            .create_deployment(CreateDeployment {
                scheduled_for: Some(at),
                ..request(&pkg, &[&a])
            })
            .await
            .unwrap();
        assert_eq!(state_of(&view, &a), RowState::Pending);
        assert_eq!(h.orch.dispatch(view.id).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.channel.install_count(), 0);

        let later = at + ChronoDuration::seconds(1);
        assert_eq!(h.orch.dispatch_at(view.id, later).await.unwrap(), 1);
        assert_eq!(h.orch.dispatch_at(view.id, later).await.unwrap(), 0);
        h.channel.wait_for_installs(1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.channel.install_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_sends_once() {
        let h = harness();
        let clients: Vec<_> = (0..5)
            .map(|i| linux_client(&h.store, &format!("host-{}", i)))
            .collect();
        let pkg = package(&h.store, "agent", OsCompatibility::All);
        let view = h
            .orch
            .create_deployment(CreateDeployment {
                scheduled_for: Some(Utc::now() + ChronoDuration::minutes(5)),
                ..request(&pkg, &clients.iter().collect::<Vec<_>>())
            })
            .await
            .unwrap();

        let due = Utc::now() + ChronoDuration::minutes(10);
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let orch = h.orch.clone();
                tokio::spawn(async move { orch.dispatch_at(view.id, due).await.unwrap() })
            })
            .collect();
        let mut total = 0;
        for t in tasks {
            total += t.await.unwrap();
        }
        assert_eq!(total, 5);
        h.channel.wait_for_installs(5).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.channel.install_count(), 5);
    }

    #[tokio::test]
    async fn test_offline_client_fails_without_dispatch() {
        let h = harness();
        let up = linux_client(&h.store, "up");
        let down = linux_client(&h.store, "down");
        h.store
            .update_client_status(down.id, ClientStatus::Offline, Utc::now())
            .unwrap();
        let pkg = package(&h.store, "agent", OsCompatibility::All);

        let view = h.orch.create_deployment(request(&pkg, &[&up, &down])).await.unwrap();
        let down_row = view.deployment_statuses.iter().find(|s| s.client.id == down.id).unwrap();
        assert_eq!(down_row.status, RowState::Failed);
        assert_eq!(down_row.error_message.as_deref(), Some("client offline"));
        assert!(down_row.completed_at.is_some());

        h.channel.wait_for_installs(1).await;
        assert_eq!(h.channel.installed_clients(), vec![up.id]);
    }

    #[tokio::test]
    async fn test_transient_channel_failure_is_retried() {
        let h = harness_with(RecordingChannel::failing(2));
        let a = linux_client(&h.store, "a");
        let pkg = package(&h.store, "agent", OsCompatibility::All);
        let view = h.orch.create_deployment(request(&pkg, &[&a])).await.unwrap();

        h.channel.wait_for_installs(1).await;
        assert_eq!(
            h.store.get_statuses(view.id).unwrap()[0].state,
            RowState::InProgress
        );
    }

    #[tokio::test]
    async fn test_exhausted_delivery_records_failure() {
        let h = harness_with(RecordingChannel::rejecting());
        let a = linux_client(&h.store, "a");
        let pkg = package(&h.store, "agent", OsCompatibility::All);
        let view = h.orch.create_deployment(request(&pkg, &[&a])).await.unwrap();

        let mut row = h.store.get_statuses(view.id).unwrap().remove(0);
        for _ in 0..200 {
            if row.state == RowState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            row = h.store.get_status(row.id).unwrap();
        }
        assert_eq!(row.state, RowState::Failed);
        assert!(row
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("unsupported package")));
    }

    #[tokio::test]
    async fn test_synthetic_timeout_result() {
        let h = harness();
        let a = linux_client(&h.store, "a");
        let pkg = package(&h.store, "agent", OsCompatibility::All);
        let view = h.orch.create_deployment(request(&pkg, &[&a])).await.unwrap();

        let row = h
            .orch
            .report_status_result(view.deployment_statuses[0].id, Outcome::failure("timeout"))
            .unwrap();
        assert_eq!(row.state, RowState::Failed);
        assert_eq!(row.error_message.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_list_by_aggregate_status() {
        let h = harness();
        let a = linux_client(&h.store, "a");
        let pkg = package(&h.store, "agent", OsCompatibility::All);
        let done = h.orch.create_deployment(request(&pkg, &[&a])).await.unwrap();
        h.orch
            .report_result(done.id, a.id, Outcome::Success { log_output: String::new() })
            .unwrap();
        let running = h.orch.create_deployment(request(&pkg, &[&a])).await.unwrap();

        let query = DeploymentQuery {
            status: Some(AggregateStatus::InProgress),
            ..Default::default()
        };
        let views = h.orch.list_deployments(&query).unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].id, running.id);

        let all = h.orch.list_deployments(&DeploymentQuery::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, running.id);
    }

    #[tokio::test]
    async fn test_result_for_undispatched_row_is_rejected() {
        let h = harness();
        let a = linux_client(&h.store, "a");
        let pkg = package(&h.store, "agent", OsCompatibility::All);
        let view = h
            .orch
            .create_deployment(CreateDeployment {
                scheduled_for: Some(Utc::now() + ChronoDuration::hours(1)),
                ..request(&pkg, &[&a])
            })
            .await
            .unwrap();

        let err = h
            .orch
            .report_result(view.id, a.id, Outcome::Success { log_output: String::new() })
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::State {
                current: RowState::Pending,
                ..
            }
        ));

        let view = h.orch.get_deployment(view.id).unwrap();
        assert_eq!(view.status, AggregateStatus::Pending);
        assert!(view.deployment_statuses[0].completed_at.is_none());
    }

    #[tokio::test]
    async fn test_stale_result_after_retry_reset_is_rejected() {
        let h = harness();
        let a = linux_client(&h.store, "a");
        let pkg = package(&h.store, "agent", OsCompatibility::All);
        let view = h
            .orch
            .create_deployment(CreateDeployment {
                scheduled_for: Some(Utc::now() + ChronoDuration::minutes(5)),
                ..request(&pkg, &[&a])
            })
            .await
            .unwrap();
        let due = Utc::now() + ChronoDuration::minutes(10);
        h.orch.dispatch_at(view.id, due).await.unwrap();
        let status_id = view.deployment_statuses[0].id;
        h.orch
            .report_status_result(status_id, Outcome::failure("disk full"))
            .unwrap();

        // A retry has reset the row but not yet dispatched it.
        h.store
            .apply_transition(
                status_id,
                &Transition::Reset {
                    log: log_line("Retry requested"),
                },
                Utc::now(),
            )
            .unwrap();
        let late = h
            .orch
            .report_status_result(status_id, Outcome::Success { log_output: "old attempt".to_string() });
        assert!(matches!(
            late,
            Err(OrchestratorError::State {
                current: RowState::Pending,
                ..
            })
        ));
        let row = h.store.get_status(status_id).unwrap();
        assert_eq!(row.state, RowState::Pending);
        assert!(!row.log_output.contains("old attempt"));

        assert_eq!(h.orch.dispatch_at(view.id, due).await.unwrap(), 1);
        assert!(matches!(
            h.orch.retry_failed(view.id).await,
            Err(OrchestratorError::NoRetryableRows(_))
        ));
        let row = h
            .orch
            .report_status_result(status_id, Outcome::Success { log_output: String::new() })
            .unwrap();
        assert_eq!(row.state, RowState::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_racing_dispatch_signals_every_started_row() {
        let h = harness();
        let clients: Vec<_> = (0..8)
            .map(|i| linux_client(&h.store, &format!("host-{}", i)))
            .collect();
        let targets: Vec<_> = clients.iter().collect();
        let pkg = package(&h.store, "agent", OsCompatibility::All);

        let mut started = HashSet::new();
        for _ in 0..10 {
            let id = h
                .orch
                .create_deployment(CreateDeployment {
                    scheduled_for: Some(Utc::now() + ChronoDuration::minutes(5)),
                    ..request(&pkg, &targets)
                })
                .await
                .unwrap()
                .id;
            let due = Utc::now() + ChronoDuration::minutes(10);

            let dispatcher = {
                let orch = h.orch.clone();
                tokio::spawn(async move { orch.dispatch_at(id, due).await.unwrap() })
            };
            let canceller = {
                let orch = h.orch.clone();
                tokio::spawn(async move { orch.cancel_deployment(id).await.unwrap() })
            };
            dispatcher.await.unwrap();
            canceller.await.unwrap();

            for row in h.store.get_statuses(id).unwrap() {
                assert_eq!(row.state, RowState::Cancelled);
                if row.log_output.contains("Dispatching") {
                    started.insert(row.id);
                }
            }
        }

        h.channel.wait_for_cancels(started.len()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let signalled: HashSet<_> = h
            .channel
            .cancels
            .lock()
            .unwrap()
            .iter()
            .map(|(_, cmd)| cmd.status_id)
            .collect();
        assert_eq!(signalled, started);
    }

    #[tokio::test]
    async fn test_list_by_aggregate_status_pages() {
        let h = harness();
        let a = linux_client(&h.store, "a");
        let pkg = package(&h.store, "agent", OsCompatibility::All);
        let mut running = Vec::new();
        for _ in 0..3 {
            running.push(h.orch.create_deployment(request(&pkg, &[&a])).await.unwrap().id);
            let done = h.orch.create_deployment(request(&pkg, &[&a])).await.unwrap();
            h.orch
                .report_result(done.id, a.id, Outcome::Success { log_output: String::new() })
                .unwrap();
        }

        let query = DeploymentQuery {
            filter: DeploymentFilter {
                limit: Some(1),
                offset: Some(1),
                ..Default::default()
            },
            status: Some(AggregateStatus::InProgress),
        };
        let views = h.orch.list_deployments(&query).unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].id, running[1]);

        assert_eq!(status_page_limit(None), MAX_STATUS_PAGE);
        assert_eq!(status_page_limit(Some(20)), 20);
        assert_eq!(status_page_limit(Some(100_000)), MAX_STATUS_PAGE);
    }

    #[test]
    fn test_outcome_wire_format() {
        let ok: Outcome = serde_json::from_str(r#"{"outcome":"success"}"#).unwrap();
        assert_eq!(ok, Outcome::Success { log_output: String::new() });

        let failed: Outcome = serde_json::from_str(
            r#"{"outcome":"failure","error_message":"exit 1","log_output":"boom"}"#,
        )
        .unwrap();
        assert_eq!(
            failed,
            Outcome::Failure {
                error_message: "exit 1".to_string(),
                log_output: "boom".to_string(),
            }
        );
    }
}
