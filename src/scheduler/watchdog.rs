//! Dispatch timeout for rows whose agent never reports back.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

use crate::db::{DbError, Store};
use crate::orchestrator::{Orchestrator, OrchestratorError, Outcome};

/// Fail every row that has been in progress longer than `timeout` with a
/// synthetic "timeout" result. Returns the number of rows failed.
pub fn expire_stale_rows(
    store: &Store,
    orchestrator: &Orchestrator,
    now: DateTime<Utc>,
    timeout: Duration,
) -> Result<usize, DbError> {
    let timeout = ChronoDuration::from_std(timeout).unwrap_or_else(|_| ChronoDuration::minutes(30));
    let stale = store.stale_in_progress(now - timeout)?;

    let mut expired = 0;
    for row in stale {
        match orchestrator.report_status_result(row.id, Outcome::failure("timeout")) {
            Ok(_) => {
                tracing::warn!(
                    deployment_id = row.deployment_id,
                    status_id = row.id,
                    client_id = row.client_id,
                    "No result within {}s, row timed out",
                    timeout.num_seconds()
                );
                expired += 1;
            }
            // A result landed between the scan and the update.
            Err(OrchestratorError::State { .. }) => {}
            Err(e) => tracing::error!(status_id = row.id, "Failed to time out row: {}", e),
        }
    }
    Ok(expired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::RecordingChannel;
    use crate::config::DispatchConfig;
    use crate::db::fixtures::*;
    use crate::db::{NewDeployment, OsCompatibility, RowState, Transition};
    use crate::registry::ClientRegistry;
    use std::sync::Arc;

    #[test]
    fn test_only_stale_rows_expire() {
        let (_tmp, store) = temp_store();
        let store = Arc::new(store);
        let registry = ClientRegistry::new(store.clone(), Duration::from_secs(180));
        let orch = Orchestrator::new(
            store.clone(),
            registry,
            Arc::new(RecordingChannel::default()),
            DispatchConfig::default(),
        );
        let a = linux_client(&store, "a");
        let b = linux_client(&store, "b");
        let pkg = package(&store, "agent", OsCompatibility::All);
        let t0 = Utc::now();
        let dep = store
            .create_deployment_with_statuses(
                &NewDeployment {
                    package_id: pkg.id,
                    client_ids: vec![a.id, b.id],
                    description: String::new(),
                    created_by: None,
                    scheduled_for: None,
                },
                t0,
            )
            .unwrap();
        let rows = store.get_statuses(dep.id).unwrap();
        let start = Transition::Start { log: String::new() };
        store.apply_transition(rows[0].id, &start, t0).unwrap();
        store
            .apply_transition(rows[1].id, &start, t0 + ChronoDuration::minutes(20))
            .unwrap();

        let timeout = Duration::from_secs(30 * 60);
        let now = t0 + ChronoDuration::minutes(31);
        assert_eq!(expire_stale_rows(&store, &orch, now, timeout).unwrap(), 1);
        assert_eq!(expire_stale_rows(&store, &orch, now, timeout).unwrap(), 0);

        let rows = store.get_statuses(dep.id).unwrap();
        assert_eq!(rows[0].state, RowState::Failed);
        assert_eq!(rows[0].error_message.as_deref(), Some("timeout"));
        assert_eq!(rows[1].state, RowState::InProgress);
    }
}
