//! Client connection registry.
//!
//! Tracks which sessions each connected client is linked to, and the reverse
//! mapping from a session to its clients. Both directions live behind a
//! single lock so they can never disagree.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;

use super::{ClientId, SessionId};

/// Information about a connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    /// Identity presented at connect time, if any.
    pub identity: Option<String>,
    /// Connect time (Unix epoch milliseconds).
    pub connected_at: u64,
    /// Sessions this client is linked to.
    pub sessions: HashSet<SessionId>,
}

#[derive(Debug, Default)]
struct Links {
    forward: HashMap<ClientId, ClientRecord>,
    reverse: HashMap<SessionId, HashSet<ClientId>>,
}

impl Links {
    fn drop_reverse(&mut self, session_id: &str, client_id: &str) {
        if let Some(clients) = self.reverse.get_mut(session_id) {
            clients.remove(client_id);
            if clients.is_empty() {
                self.reverse.remove(session_id);
            }
        }
    }
}

/// Registry of connected clients and their session links.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    links: Mutex<Links>,
}

impl ClientRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly connected client. Re-registering keeps existing
    /// links and refreshes the identity.
    pub async fn register(&self, client_id: &str, identity: Option<String>) {
        let mut links = self.links.lock().await;
        links
            .forward
            .entry(client_id.to_string())
            .and_modify(|record| record.identity = identity.clone())
            .or_insert_with(|| ClientRecord {
                identity,
                connected_at: now_millis(),
                sessions: HashSet::new(),
            });
    }

    /// Links a client to a session. Returns `false` if the client is not
    /// registered.
    pub async fn link(&self, client_id: &str, session_id: &str) -> bool {
        let mut links = self.links.lock().await;
        let Some(record) = links.forward.get_mut(client_id) else {
            return false;
        };
        record.sessions.insert(session_id.to_string());
        links
            .reverse
            .entry(session_id.to_string())
            .or_default()
            .insert(client_id.to_string());
        true
    }

    /// Removes a single link. Returns whether it existed.
    pub async fn unlink(&self, client_id: &str, session_id: &str) -> bool {
        let mut links = self.links.lock().await;
        let existed = links
            .forward
            .get_mut(client_id)
            .map(|record| record.sessions.remove(session_id))
            .unwrap_or(false);
        links.drop_reverse(session_id, client_id);
        existed
    }

    /// Removes a client and all of its links, returning the sessions it was
    /// linked to.
    pub async fn unregister(&self, client_id: &str) -> Vec<SessionId> {
        let mut links = self.links.lock().await;
        let Some(record) = links.forward.remove(client_id) else {
            return Vec::new();
        };
        for session_id in &record.sessions {
            links.drop_reverse(session_id, client_id);
        }
        record.sessions.into_iter().collect()
    }

    /// Removes every link to a session, returning the clients that were
    /// linked.
    pub async fn unlink_session(&self, session_id: &str) -> Vec<ClientId> {
        let mut links = self.links.lock().await;
        let clients = links.reverse.remove(session_id).unwrap_or_default();
        for client_id in &clients {
            if let Some(record) = links.forward.get_mut(client_id) {
                record.sessions.remove(session_id);
            }
        }
        clients.into_iter().collect()
    }

    /// Returns whether the client is linked to the session.
    pub async fn is_linked(&self, client_id: &str, session_id: &str) -> bool {
        let links = self.links.lock().await;
        links
            .forward
            .get(client_id)
            .is_some_and(|record| record.sessions.contains(session_id))
    }

    /// Sessions a client is linked to.
    pub async fn sessions_of(&self, client_id: &str) -> Vec<SessionId> {
        let links = self.links.lock().await;
        links
            .forward
            .get(client_id)
            .map(|record| record.sessions.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Clients linked to a session.
    pub async fn clients_of(&self, session_id: &str) -> Vec<ClientId> {
        let links = self.links.lock().await;
        links
            .reverse
            .get(session_id)
            .map(|clients| clients.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of a client's record.
    pub async fn get(&self, client_id: &str) -> Option<ClientRecord> {
        self.links.lock().await.forward.get(client_id).cloned()
    }

    /// Number of connected clients.
    pub async fn count(&self) -> usize {
        self.links.lock().await.forward.len()
    }

    #[cfg(test)]
    async fn assert_consistent(&self) {
        let links = self.links.lock().await;
        for (client_id, record) in &links.forward {
            for session_id in &record.sessions {
                assert!(
                    links.reverse.get(session_id).is_some_and(|c| c.contains(client_id)),
                    "forward link {client_id} -> {session_id} missing in reverse map"
                );
            }
        }
        for (session_id, clients) in &links.reverse {
            assert!(!clients.is_empty(), "empty reverse entry for {session_id}");
            for client_id in clients {
                assert!(
                    links
                        .forward
                        .get(client_id)
                        .is_some_and(|r| r.sessions.contains(session_id)),
                    "reverse link {session_id} -> {client_id} missing in forward map"
                );
            }
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
