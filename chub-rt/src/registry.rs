//! Registry of open client connections, keyed by user id
//!
//! Each open event stream owns one bounded queue. A user may hold several
//! connections at once (one per device or tab). Sends never block: a full
//! queue drops the event for that connection only, a closed queue is pruned.

use chrono::{DateTime, Utc};
use chub_common::events::ChubEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct ClientConnection {
    id: u64,
    tx: mpsc::Sender<ChubEvent>,
    connected_at: DateTime<Utc>,
}

/// Result of pushing one event to one user's connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOutcome {
    /// Connections that accepted the event
    pub delivered: usize,
    /// Live connections whose queue was full
    pub dropped: usize,
}

/// Snapshot of one user's presence, for the admin connections view
#[derive(Debug, Clone, serde::Serialize)]
pub struct UserPresence {
    pub user_id: Uuid,
    pub connections: usize,
    pub connected_since: DateTime<Utc>,
}

/// In-memory registry of open stream connections
///
/// Uses a std `RwLock`: critical sections are short and never await, and
/// [`ConnectionGuard`] must be able to unregister from `Drop`.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, Vec<ClientConnection>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Open a connection for `user_id`
    ///
    /// The connection stays registered until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, user_id: Uuid) -> (ConnectionGuard, mpsc::Receiver<ChubEvent>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let total = {
            let mut connections = self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let entry = connections.entry(user_id).or_default();
            entry.push(ClientConnection {
                id,
                tx,
                connected_at: Utc::now(),
            });
            entry.len()
        };
        info!(
            "Connection {} opened for user {} ({} open for this user)",
            id, user_id, total
        );

        let guard = ConnectionGuard {
            registry: Arc::clone(self),
            user_id,
            connection_id: id,
        };
        (guard, rx)
    }

    fn unregister(&self, user_id: Uuid, connection_id: u64) {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = connections.get_mut(&user_id) {
            entry.retain(|c| c.id != connection_id);
            if entry.is_empty() {
                connections.remove(&user_id);
            }
        }
        debug!("Connection {} closed for user {}", connection_id, user_id);
    }

    /// Push an event to every open connection of `user_id` without blocking
    pub fn send_to_user(&self, user_id: Uuid, event: &ChubEvent) -> SendOutcome {
        let mut outcome = SendOutcome::default();
        let mut closed = Vec::new();

        {
            let connections = self
                .connections
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(entry) = connections.get(&user_id) else {
                return outcome;
            };

            for connection in entry {
                match connection.tx.try_send(event.clone()) {
                    Ok(()) => outcome.delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            "Connection {} for user {} is not keeping up; dropped {}",
                            connection.id,
                            user_id,
                            event.event_type()
                        );
                        outcome.dropped += 1;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(connection.id),
                }
            }
        }

        for connection_id in closed {
            self.unregister(user_id, connection_id);
        }
        outcome
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&user_id)
    }

    /// Total open connections across all users
    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn online_users(&self) -> Vec<UserPresence> {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut presence: Vec<UserPresence> = connections
            .iter()
            .filter_map(|(user_id, entry)| {
                let connected_since = entry.iter().map(|c| c.connected_at).min()?;
                Some(UserPresence {
                    user_id: *user_id,
                    connections: entry.len(),
                    connected_since,
                })
            })
            .collect();
        presence.sort_by_key(|p| p.connected_since);
        presence
    }
}

/// Keeps a connection registered; unregisters it on drop
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    user_id: Uuid,
    connection_id: u64,
}

impl ConnectionGuard {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.user_id, self.connection_id);
    }
}
