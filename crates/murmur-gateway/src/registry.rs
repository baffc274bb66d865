//! Connection registry: which live connections belong to which user.
//!
//! Two maps are kept in step under one lock:
//! - `connection → (username, outbound queue)` for delivery and cleanup
//! - `username → connection ids` for presence and directed delivery
//!
//! A username is present in the second map iff it has at least one live
//! connection. Only these methods touch the maps.

use std::collections::{HashMap, HashSet};

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use murmur_types::events::GatewayEvent;

pub type ConnectionId = Uuid;

/// Outbound queue of one connection, drained by its WebSocket writer.
pub type EventSender = mpsc::UnboundedSender<GatewayEvent>;

/// A user crossing the online/offline boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub username: String,
    pub online: bool,
}

struct Entry {
    username: String,
    tx: EventSender,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, Entry>,
    users: HashMap<String, HashSet<ConnectionId>>,
}

impl RegistryInner {
    /// Detach a connection from its user. Returns the user if that was
    /// their last connection.
    fn detach(&mut self, conn_id: ConnectionId, username: &str) -> Option<String> {
        let ids = self.users.get_mut(username)?;
        ids.remove(&conn_id);
        if ids.is_empty() {
            self.users.remove(username);
            return Some(username.to_string());
        }
        None
    }
}

#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection to `username`. Re-joining with the same id
    /// replaces its username and queue.
    pub async fn join(
        &self,
        conn_id: ConnectionId,
        username: &str,
        tx: EventSender,
    ) -> Vec<PresenceChange> {
        let mut inner = self.inner.write().await;
        let mut changes = Vec::new();

        if let Some(previous) = inner.connections.remove(&conn_id) {
            if let Some(gone) = inner.detach(conn_id, &previous.username) {
                changes.push(PresenceChange {
                    username: gone,
                    online: false,
                });
            }
        }

        let ids = inner.users.entry(username.to_string()).or_default();
        let came_online = ids.is_empty();
        ids.insert(conn_id);
        inner.connections.insert(
            conn_id,
            Entry {
                username: username.to_string(),
                tx,
            },
        );

        if came_online {
            changes.push(PresenceChange {
                username: username.to_string(),
                online: true,
            });
        }
        debug!(%conn_id, username, "registry join");
        changes
    }

    /// Detach a connection. Unknown ids are ignored.
    pub async fn leave(&self, conn_id: ConnectionId) -> Vec<PresenceChange> {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.connections.remove(&conn_id) else {
            return Vec::new();
        };
        debug!(%conn_id, username = %entry.username, "registry leave");

        inner
            .detach(conn_id, &entry.username)
            .map(|username| PresenceChange {
                username,
                online: false,
            })
            .into_iter()
            .collect()
    }

    /// Point a registered connection at a new queue. `prime` runs first,
    /// under the write lock, so whatever it queues lands ahead of every event
    /// sent after the swap. Returns `false` if the connection is gone.
    pub async fn replace_queue<F>(&self, conn_id: ConnectionId, tx: EventSender, prime: F) -> bool
    where
        F: FnOnce(&EventSender),
    {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.connections.get_mut(&conn_id) else {
            return false;
        };
        prime(&tx);
        entry.tx = tx;
        true
    }

    pub async fn connections_for(&self, username: &str) -> HashSet<ConnectionId> {
        self.inner
            .read()
            .await
            .users
            .get(username)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn is_online(&self, username: &str) -> bool {
        self.inner.read().await.users.contains_key(username)
    }

    /// Online usernames, sorted.
    pub async fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.inner.read().await.users.keys().cloned().collect();
        users.sort();
        users
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Queue an event on every registered connection. Returns how many
    /// queues accepted it.
    pub async fn send_to_all(&self, event: &GatewayEvent) -> usize {
        let inner = self.inner.read().await;
        inner
            .connections
            .iter()
            .filter(|(conn_id, entry)| deliver(**conn_id, entry, event))
            .count()
    }

    /// Queue an event on every connection of `username`.
    pub async fn send_to_user(&self, username: &str, event: &GatewayEvent) -> usize {
        let inner = self.inner.read().await;
        let Some(ids) = inner.users.get(username) else {
            return 0;
        };
        ids.iter()
            .filter_map(|id| inner.connections.get(id).map(|entry| (*id, entry)))
            .filter(|(conn_id, entry)| deliver(*conn_id, entry, event))
            .count()
    }

    /// Queue an event on the connections of any of `usernames`, once per
    /// connection even if a name repeats.
    pub async fn send_to_users(&self, usernames: &[&str], event: &GatewayEvent) -> usize {
        let inner = self.inner.read().await;
        let targets: HashSet<ConnectionId> = usernames
            .iter()
            .filter_map(|name| inner.users.get(*name))
            .flatten()
            .copied()
            .collect();
        targets
            .iter()
            .filter_map(|id| inner.connections.get(id).map(|entry| (*id, entry)))
            .filter(|(conn_id, entry)| deliver(*conn_id, entry, event))
            .count()
    }

    /// Queue an event on one connection.
    pub async fn send_to_connection(&self, conn_id: ConnectionId, event: &GatewayEvent) -> bool {
        let inner = self.inner.read().await;
        inner
            .connections
            .get(&conn_id)
            .is_some_and(|entry| deliver(conn_id, entry, event))
    }
}

/// A closed queue means the connection is going away; that must not stop
/// delivery to anyone else.
fn deliver(conn_id: ConnectionId, entry: &Entry, event: &GatewayEvent) -> bool {
    if entry.tx.send(event.clone()).is_err() {
        warn!(%conn_id, username = %entry.username, "Dropping event for closed connection");
        return false;
    }
    true
}
