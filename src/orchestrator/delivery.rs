//! Command delivery to agents with bounded retry.

use chrono::Utc;
use std::fmt::Display;
use std::future::{ready, Future};
use std::time::Duration;

use super::{log_line, Orchestrator};
use crate::agent::{AgentChannel, CancelCommand, ChannelError, InstallCommand};
use crate::config::DispatchConfig;
use crate::db::{ClientMachine, DbError, Store, Transition};

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` attempts have been made.
pub(crate) async fn retry_with_backoff<T, E, F, Fut>(
    policy: &DispatchConfig,
    what: &str,
    mut op: F,
    retryable: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && retryable(&e) => {
                let delay = backoff_delay(policy.backoff, attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what,
                    attempt,
                    max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Exponential backoff with up to 50% jitter.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << (attempt - 1).min(16));
    let jitter_cap = exp.as_millis() as u64 / 2;
    let jitter = if jitter_cap > 0 {
        rand::random::<u64>() % jitter_cap
    } else {
        0
    };
    exp + Duration::from_millis(jitter)
}

/// Retry a store write with the dispatch policy. Conflicts are final.
pub(crate) async fn store_with_retry<T>(
    policy: &DispatchConfig,
    what: &str,
    mut op: impl FnMut() -> Result<T, DbError>,
) -> Result<T, DbError> {
    retry_with_backoff(policy, what, move || ready(op()), |e: &DbError| {
        !matches!(e, DbError::Conflict { .. } | DbError::NotFound)
    })
    .await
}

/// Deliver one install command. Runs as its own task; an exhausted or
/// rejected delivery is recorded as a failed row.
pub(crate) async fn deliver_install(orch: Orchestrator, client: ClientMachine, command: InstallCommand) {
    let channel: &dyn AgentChannel = orch.channel.as_ref();
    let (target, cmd) = (&client, &command);

    let result = retry_with_backoff(
        &orch.policy,
        &format!("install on {}", client.hostname),
        move || channel.install(target, cmd),
        ChannelError::is_retryable,
    )
    .await;

    match result {
        Ok(()) => tracing::debug!(
            status_id = command.status_id,
            client_id = client.id,
            "Install command accepted by {}",
            client.hostname
        ),
        Err(e) => {
            tracing::error!(
                status_id = command.status_id,
                client_id = client.id,
                "Install delivery to {} failed: {}",
                client.hostname,
                e
            );
            let transition = Transition::Abort {
                error: e.to_string(),
                log: log_line(&format!("Delivery failed: {}", e)),
            };
            record(&orch.store, &orch.policy, command.status_id, &transition).await;
        }
    }
}

/// Send a best-effort cancel signal. Failures are logged only.
pub(crate) async fn send_cancel(orch: Orchestrator, client: ClientMachine, command: CancelCommand) {
    let channel: &dyn AgentChannel = orch.channel.as_ref();
    let (target, cmd) = (&client, &command);

    let result = retry_with_backoff(
        &orch.policy,
        &format!("cancel on {}", client.hostname),
        move || channel.cancel(target, cmd),
        ChannelError::is_retryable,
    )
    .await;

    if let Err(e) = result {
        tracing::warn!(
            status_id = command.status_id,
            "Cancel signal to {} not delivered: {}",
            client.hostname,
            e
        );
    }
}

/// Apply a transition from a background task, logging rather than returning errors.
async fn record(store: &Store, policy: &DispatchConfig, status_id: i64, transition: &Transition) {
    let result = store_with_retry(policy, "record delivery failure", || {
        store.apply_transition(status_id, transition, Utc::now())
    })
    .await;

    match result {
        Ok(_) => {}
        Err(DbError::Conflict { current, .. }) => {
            tracing::debug!(status_id, "Row already {}, delivery failure dropped", current)
        }
        Err(e) => tracing::error!(status_id, "Failed to record delivery failure: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> DispatchConfig {
        DispatchConfig {
            max_attempts,
            backoff: Duration::ZERO,
            skip_offline: true,
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            &policy(3),
            "op",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                ready(if n < 3 { Err(format!("try {}", n)) } else { Ok(n) })
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_retry_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff(
            &policy(2),
            "op",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                ready(Err("down".to_string()))
            },
            |_| true,
        )
        .await;
        tokio_test::assert_err!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ChannelError> = retry_with_backoff(
            &policy(5),
            "op",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                ready(Err(ChannelError::Rejected("no".to_string())))
            },
            ChannelError::is_retryable,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_grows() {
        let base = Duration::from_millis(100);
        assert!(backoff_delay(base, 1) >= base);
        assert!(backoff_delay(base, 1) < base * 2);
        assert!(backoff_delay(base, 3) >= base * 4);
        assert_eq!(backoff_delay(Duration::ZERO, 4), Duration::ZERO);
    }
}
