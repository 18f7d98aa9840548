//! Live control connections, keyed by the service name they handshook with.
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{error::CorralError, message::Message, service::ServiceTable};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outbound half of a control connection.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Writes one message to the peer.
    fn send(&self, message: &Message) -> Result<(), CorralError>;

    /// Printable peer address, for logs.
    fn peer(&self) -> String {
        self.id().to_string()
    }
}

/// One service's control connection as last seen by the registry.
#[derive(Clone)]
pub struct Node {
    name: String,
    connection: Arc<dyn Connection>,
    connected: bool,
    connected_at: DateTime<Utc>,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Sends over the node's connection; fails once the node has disconnected.
    pub fn send(&self, message: &Message) -> Result<(), CorralError> {
        if !self.connected {
            return Err(CorralError::NodeNotConnected(self.name.clone()));
        }
        self.connection.send(message)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("connection", &self.connection.id())
            .field("connected", &self.connected)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

#[derive(Default)]
struct RegistryState {
    nodes: HashMap<String, Node>,
    by_connection: HashMap<ConnectionId, String>,
}

/// Maps service names to nodes, with a secondary index by connection id.
///
/// Handshakes and disconnects also update the health of the matching managed
/// service. The registry lock is always released before a service lock is
/// taken.
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    services: ServiceTable,
}

impl ConnectionRegistry {
    pub fn new(services: ServiceTable) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            services,
        }
    }

    /// Binds `name` to `connection`, replacing any earlier node of that name,
    /// and marks the managed service healthy.
    ///
    /// Returns the replaced node, if any.
    pub fn handshake(
        &self,
        name: &str,
        connection: Arc<dyn Connection>,
    ) -> Result<Option<Node>, CorralError> {
        let id = connection.id();
        let (replaced, abandoned) = {
            let mut state = self.state.lock()?;

            // A connection that re-handshakes under a new name gives up the old one.
            let mut abandoned = None;
            if let Some(previous_name) = state.by_connection.get(&id).cloned()
                && previous_name != name
                && let Some(node) = state.nodes.get_mut(&previous_name)
            {
                node.connected = false;
                abandoned = Some(previous_name);
            }

            let node = Node {
                name: name.to_string(),
                connection,
                connected: true,
                connected_at: Utc::now(),
            };
            let replaced = state.nodes.insert(name.to_string(), node);
            if let Some(old) = &replaced
                && old.connection_id() != id
            {
                state.by_connection.remove(&old.connection_id());
            }
            state.by_connection.insert(id, name.to_string());
            (replaced, abandoned)
        };

        if let Some(previous_name) = abandoned {
            warn!("Node '{previous_name}' released by {id}, now '{name}'");
            if let Some(runner) = self.services.get(&previous_name) {
                runner.mark_unhealthy("disconnected")?;
            }
        }

        if replaced.as_ref().is_some_and(|old| old.connected) {
            info!("Node '{name}' reconnected on {id}");
        } else {
            info!("Node '{name}' connected on {id}");
        }

        match self.services.get(name) {
            Some(runner) => runner.mark_healthy()?,
            None => debug!("Node '{name}' has no managed service"),
        }
        Ok(replaced)
    }

    /// Marks the node bound to `id` as disconnected and its service unhealthy.
    ///
    /// Returns the node name, or `None` when the connection never handshook
    /// or was already replaced by a newer connection.
    pub fn disconnect_by_connection(&self, id: ConnectionId) -> Result<Option<String>, CorralError> {
        let name = {
            let mut state = self.state.lock()?;
            let Some(name) = state.by_connection.remove(&id) else {
                return Ok(None);
            };
            match state.nodes.get_mut(&name) {
                Some(node) if node.connection_id() == id => node.connected = false,
                _ => return Ok(None),
            }
            name
        };

        warn!("Node '{name}' disconnected ({id})");
        if let Some(runner) = self.services.get(&name) {
            runner.mark_unhealthy("disconnected")?;
        }
        Ok(Some(name))
    }

    pub fn get(&self, name: &str) -> Option<Node> {
        self.lock_state().nodes.get(name).cloned()
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.lock_state()
            .nodes
            .get(name)
            .is_some_and(|node| node.connected)
    }

    /// Forgets a node entirely.
    pub fn unregister(&self, name: &str) -> Option<Node> {
        let mut state = self.lock_state();
        let node = state.nodes.remove(name)?;
        if state.by_connection.get(&node.connection_id()).map(String::as_str) == Some(name) {
            state.by_connection.remove(&node.connection_id());
        }
        Some(node)
    }

    /// Name and connected flag of every known node, sorted by name.
    pub fn all(&self) -> Vec<(String, bool)> {
        let mut nodes: Vec<_> = self
            .lock_state()
            .nodes
            .values()
            .map(|node| (node.name.clone(), node.connected))
            .collect();
        nodes.sort();
        nodes
    }

    /// Sends `message` to the connected node `name`.
    pub fn send_to(&self, name: &str, message: &Message) -> Result<(), CorralError> {
        // Clone out so the write happens without the registry lock.
        let node = self
            .get(name)
            .ok_or_else(|| CorralError::NodeNotConnected(name.to_string()))?;
        node.send(message)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
