//! Client registry: known client machines and their liveness.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::db::{ClientFilter, ClientMachine, ClientStatus, DbError, NewClient, Store};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid client: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] DbError),
}

/// Resolves client ids and tracks liveness from agent heartbeats.
#[derive(Clone)]
pub struct ClientRegistry {
    store: Arc<Store>,
    offline_after: Duration,
}

impl ClientRegistry {
    pub fn new(store: Arc<Store>, offline_after: Duration) -> Self {
        Self {
            store,
            offline_after,
        }
    }

    pub fn resolve(&self, id: i64) -> Result<ClientMachine, DbError> {
        self.store.get_client(id)
    }

    pub fn list(&self, filter: &ClientFilter) -> Result<Vec<ClientMachine>, DbError> {
        self.store.get_clients(filter)
    }

    /// Register a new client machine.
    pub fn register(&self, client: NewClient) -> Result<ClientMachine, RegistryError> {
        let hostname = client.hostname.trim();
        if hostname.is_empty() {
            return Err(RegistryError::Validation("hostname is required".to_string()));
        }
        if client.ip_address.trim().parse::<IpAddr>().is_err() {
            return Err(RegistryError::Validation(format!(
                "invalid IP address: {}",
                client.ip_address
            )));
        }

        let client = NewClient {
            hostname: hostname.to_string(),
            ip_address: client.ip_address.trim().to_string(),
            ..client
        };
        let registered = self.store.add_client(&client, Utc::now())?;
        tracing::info!(client_id = registered.id, "Registered client {}", registered.hostname);
        Ok(registered)
    }

    /// Record a heartbeat: the client is online as of now.
    pub fn check_in(&self, id: i64) -> Result<ClientMachine, DbError> {
        self.store.update_client_status(id, ClientStatus::Online, Utc::now())
    }

    pub fn set_status(&self, id: i64, status: ClientStatus) -> Result<ClientMachine, DbError> {
        let client = self.store.update_client_status(id, status, Utc::now())?;
        tracing::info!(client_id = id, "Client {} is now {}", client.hostname, status);
        Ok(client)
    }

    /// Whether commands should be sent to this client.
    pub fn is_reachable(&self, client: &ClientMachine) -> bool {
        client.status != ClientStatus::Offline
    }

    /// Mark online clients that have not checked in within the offline
    /// threshold as offline.
    pub fn sweep_stale(&self, now: DateTime<Utc>) -> Result<usize, DbError> {
        let threshold = ChronoDuration::from_std(self.offline_after)
            .unwrap_or_else(|_| ChronoDuration::seconds(180));
        let changed = self.store.mark_stale_clients_offline(now - threshold)?;
        if changed > 0 {
            tracing::info!("Marked {} stale clients offline", changed);
        }
        Ok(changed)
    }
}
