//! Background loop that starts due deployments and keeps row and client
//! state honest when agents go quiet.

mod watchdog;

pub use watchdog::*;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::SchedulerConfig;
use crate::db::Store;
use crate::orchestrator::Orchestrator;
use crate::registry::ClientRegistry;

/// What one scheduler pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: usize,
    pub timed_out: usize,
    pub clients_offline: usize,
}

/// Periodic driver for scheduled dispatch, the dispatch timeout and client
/// liveness.
pub struct Scheduler {
    store: Arc<Store>,
    orchestrator: Orchestrator,
    registry: ClientRegistry,
    config: SchedulerConfig,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        orchestrator: Orchestrator,
        registry: ClientRegistry,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            orchestrator,
            registry,
            config,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the scheduler background task.
    pub async fn start(self: &Arc<Self>) {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        let mut rx = tx.subscribe();
        *self.stop.lock().await = Some(tx);

        tracing::info!(
            "Starting scheduler (interval {:?}, dispatch timeout {:?})",
            self.config.interval,
            self.config.dispatch_timeout
        );

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        scheduler.tick(Utc::now()).await;
                    }
                }
            }
            tracing::info!("Scheduler stopped");
        });
    }

    /// Stop the background task.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }

    /// Run one pass as of `now`. Errors are logged; a failing step does not
    /// stop the others.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        match self.registry.sweep_stale(now) {
            Ok(n) => report.clients_offline = n,
            Err(e) => tracing::error!("Scheduler: Failed to sweep client liveness: {}", e),
        }

        match self.store.due_deployment_ids(now) {
            Ok(ids) => {
                for id in ids {
                    match self.orchestrator.dispatch_at(id, now).await {
                        Ok(n) => report.dispatched += n,
                        Err(e) => {
                            tracing::error!(deployment_id = id, "Scheduler: Dispatch failed: {}", e)
                        }
                    }
                }
            }
            Err(e) => tracing::error!("Scheduler: Failed to get due deployments: {}", e),
        }

        match expire_stale_rows(&self.store, &self.orchestrator, now, self.config.dispatch_timeout) {
            Ok(n) => report.timed_out = n,
            Err(e) => tracing::error!("Scheduler: Failed to expire stale rows: {}", e),
        }

        if report != TickReport::default() {
            tracing::debug!(?report, "Scheduler tick");
        }
        report
    }
}
