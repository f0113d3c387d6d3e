//! Ownership router
//!
//! Tracks connected clients and which terminals each one owns, and fans
//! terminal output out to owners only. Ownership is never implied: a
//! connection enters a terminal's owner set exclusively through
//! `grant` (spawn-for-self or an explicit ownership request). Merely being
//! connected gets you a terminal-list snapshot and nothing else.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use tether_protocol::ServerMessage;

/// Unique client connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a ConnectionId from a raw value (mainly for testing)
    #[cfg(test)]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection({})", self.0)
    }
}

/// Entry for a connected client
pub struct ConnectionEntry {
    /// Channel for sending messages to this client
    sender: mpsc::Sender<ServerMessage>,
}

/// Router tracking connections and the terminal-ownership relation
///
/// Thread-safe for concurrent access from connection tasks and the
/// per-terminal output pumps.
pub struct OwnershipRouter {
    /// Connection ID -> entry
    connections: DashMap<ConnectionId, ConnectionEntry>,
    /// Terminal ID -> set of owning connections
    owners: DashMap<Uuid, HashSet<ConnectionId>>,
    /// Connection ID -> set of owned terminals (reverse index for cleanup)
    owned: DashMap<ConnectionId, HashSet<Uuid>>,
    /// Counter for generating unique connection IDs
    next_connection_id: AtomicU64,
}

impl Default for OwnershipRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnershipRouter {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            owners: DashMap::new(),
            owned: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    // ==================== Connection Management ====================

    /// Register a new client connection. The connection owns nothing yet.
    pub fn register_connection(&self, sender: mpsc::Sender<ServerMessage>) -> ConnectionId {
        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::SeqCst));
        self.connections.insert(id, ConnectionEntry { sender });
        debug!("Registered {}", id);
        id
    }

    /// Unregister a connection and remove it from every ownership set
    pub fn unregister_connection(&self, connection_id: ConnectionId) {
        if self.connections.remove(&connection_id).is_none() {
            return;
        }

        if let Some((_, terminals)) = self.owned.remove(&connection_id) {
            for terminal_id in terminals {
                self.remove_owner(connection_id, terminal_id);
            }
        }

        debug!("Unregistered {}", connection_id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // ==================== Ownership ====================

    /// Add a connection to a terminal's owner set
    ///
    /// Returns `false` when the connection is unknown (already closed).
    pub fn grant(&self, connection_id: ConnectionId, terminal_id: Uuid) -> bool {
        if !self.connections.contains_key(&connection_id) {
            return false;
        }

        self.owners
            .entry(terminal_id)
            .or_default()
            .insert(connection_id);
        self.owned
            .entry(connection_id)
            .or_default()
            .insert(terminal_id);

        debug!("{} now owns terminal {}", connection_id, terminal_id);
        true
    }

    /// Remove a connection from a terminal's owner set
    pub fn release(&self, connection_id: ConnectionId, terminal_id: Uuid) -> bool {
        let was_owner = self.remove_owner(connection_id, terminal_id);

        if let Some(mut terminals) = self.owned.get_mut(&connection_id) {
            terminals.remove(&terminal_id);
        }

        if was_owner {
            debug!("{} released terminal {}", connection_id, terminal_id);
        }
        was_owner
    }

    /// Drop a terminal's entire owner set (terminal closed)
    pub fn remove_terminal(&self, terminal_id: Uuid) {
        if let Some((_, connections)) = self.owners.remove(&terminal_id) {
            for connection_id in connections {
                if let Some(mut terminals) = self.owned.get_mut(&connection_id) {
                    terminals.remove(&terminal_id);
                }
            }
        }
    }

    pub fn owns(&self, connection_id: ConnectionId, terminal_id: Uuid) -> bool {
        self.owners
            .get(&terminal_id)
            .map(|set| set.contains(&connection_id))
            .unwrap_or(false)
    }

    /// Current owner set for a terminal
    pub fn owners(&self, terminal_id: Uuid) -> Vec<ConnectionId> {
        self.owners
            .get(&terminal_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn owner_count(&self, terminal_id: Uuid) -> usize {
        self.owners
            .get(&terminal_id)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    fn remove_owner(&self, connection_id: ConnectionId, terminal_id: Uuid) -> bool {
        if let Some(mut set) = self.owners.get_mut(&terminal_id) {
            let removed = set.remove(&connection_id);
            if set.is_empty() {
                drop(set); // Release the lock before removing
                self.owners.remove(&terminal_id);
            }
            removed
        } else {
            false
        }
    }

    // ==================== Delivery ====================

    /// Deliver an output chunk to the terminal's current owners, and only
    /// to them. An empty owner set drops the chunk; scrollback stays
    /// retrievable on demand.
    ///
    /// Non-blocking: a slow client loses chunks rather than stalling the
    /// pump; a closed client is unregistered.
    pub fn route_output(&self, terminal_id: Uuid, data: Vec<u8>) -> usize {
        let owner_ids = self.owners(terminal_id);
        if owner_ids.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        for connection_id in owner_ids {
            let msg = ServerMessage::Output {
                terminal_id,
                data: data.clone(),
            };
            if self.try_send(connection_id, msg) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Queue a message to every owner of a terminal, optionally excluding
    /// one connection (usually the request originator, which gets a direct
    /// response instead)
    pub fn notify_owners(
        &self,
        terminal_id: Uuid,
        except: Option<ConnectionId>,
        message: ServerMessage,
    ) -> usize {
        let mut delivered = 0;
        for connection_id in self.owners(terminal_id) {
            if Some(connection_id) == except {
                continue;
            }
            if self.try_send(connection_id, message.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Send a message to one connection (non-blocking)
    ///
    /// Returns `false` when the connection is gone or its channel is full.
    /// A closed channel unregisters the connection.
    pub fn try_send(&self, connection_id: ConnectionId, message: ServerMessage) -> bool {
        let sender = match self.connections.get(&connection_id) {
            Some(entry) => entry.sender.clone(),
            None => return false,
        };

        match sender.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("{} channel closed, removing", connection_id);
                self.unregister_connection(connection_id);
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("{} channel full, message dropped", connection_id);
                false
            }
        }
    }

    /// Send a message to one connection, waiting for channel capacity
    pub async fn send(&self, connection_id: ConnectionId, message: ServerMessage) -> bool {
        let sender = match (self.connections.get(&connection_id)).map(|e| e.sender.clone()) {
            Some(sender) => sender,
            None => return false,
        };

        match sender.send(message).await {
            Ok(()) => true,
            Err(_) => {
                warn!("{} channel closed, removing", connection_id);
                self.unregister_connection(connection_id);
                false
            }
        }
    }
}

impl std::fmt::Debug for OwnershipRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnershipRouter")
            .field("connection_count", &self.connections.len())
            .field("owned_terminal_count", &self.owners.len())
            .finish()
    }
}
