pub mod auth;
pub mod connection;
pub mod forward;
#[cfg(test)]
pub(crate) mod mock;
pub mod session;
pub mod state;
pub mod transport;

pub use auth::{AuthConfig, Credential};
pub use connection::{CancelToken, Connection, ConnectionDeps, ConnectionInfo};
pub use forward::ForwardInfo;
pub use session::Ssh2Connector;
pub use state::{ConnectionState, StateChange, Subscription};

use crate::config::HostConfig;
use crate::error::EngineResult;
use crate::scheduler::Scheduler;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Manages all connections, keyed by `host:port:username`
pub struct ConnectionRegistry {
    deps: ConnectionDeps,
    scheduler: Scheduler,
    connections: DashMap<String, Connection>,
}

impl ConnectionRegistry {
    pub fn new(deps: ConnectionDeps, scheduler: Scheduler) -> Self {
        Self {
            deps,
            scheduler,
            connections: DashMap::new(),
        }
    }

    /// The existing connection for `host`, or a new disconnected one.
    ///
    /// `credential` only applies when the connection is created; an existing
    /// connection keeps its own. Remove it first to switch credentials.
    pub fn get_or_create(&self, host: &HostConfig, credential: Option<Credential>) -> Connection {
        let id = host.connection_id();
        match self.connections.entry(id.clone()) {
            Entry::Occupied(entry) => {
                let connection = entry.get().clone();
                if credential.is_some() && connection.credential() != credential.as_ref() {
                    tracing::debug!("Ignoring new credential for existing connection {}", id);
                }
                connection
            }
            Entry::Vacant(entry) => {
                tracing::debug!("Created connection: {}", id);
                entry
                    .insert(Connection::new(host.clone(), credential, self.deps.clone()))
                    .clone()
            }
        }
    }

    /// Get or create the connection and make sure it is connected
    pub async fn connect(&self, host: &HostConfig, credential: Option<Credential>) -> EngineResult<Connection> {
        let connection = self.get_or_create(host, credential);
        connection.connect().await?;
        Ok(connection)
    }

    pub fn get(&self, id: &str) -> Option<Connection> {
        self.connections.get(id).map(|c| c.clone())
    }

    /// Disconnect and forget a connection, dropping its queued work
    pub async fn remove(&self, id: &str) -> Option<Connection> {
        let (_, connection) = self.connections.remove(id)?;
        connection.disconnect().await;
        self.scheduler.clear_connection(id);
        tracing::info!("Removed connection: {}", id);
        Some(connection)
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self.connections.iter().map(|c| c.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub async fn disconnect_all(&self) {
        let connections: Vec<Connection> = self.connections.iter().map(|c| c.clone()).collect();
        for connection in connections {
            connection.disconnect().await;
        }
    }
}
