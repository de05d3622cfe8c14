//! Session registry.
//!
//! Maps session ids to live [`Session`]s and keeps short-lived tombstones for
//! sessions that closed, so that a client reconnecting to a closed id gets a
//! definite "already closed" answer instead of silently spawning a new shell.
//!
//! Creation is atomic per id: concurrent `get_or_create` calls for the same
//! id go through the map's entry API, exactly one of them spawns, and the
//! others wait for that spawn to finish.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use protocol::CloseReason;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::lifecycle::{Session, SessionNotice, SessionSettings, SessionSummary};
use super::pty::{PtySpawner, SpawnOptions, TerminalSize};
use super::{SessionError, SessionId};

/// Longest accepted client-supplied session id.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Parameters used when a lookup has to create the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// Identity of the creator, recorded as owner.
    pub owner: Option<String>,
    /// Initial terminal size.
    pub size: TerminalSize,
    /// Shell to run.
    pub shell: String,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Environment for the shell.
    pub env: Vec<(String, String)>,
}

/// What remains of a closed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedSession {
    /// Session identifier.
    pub id: SessionId,
    /// Recorded owner.
    pub owner: Option<String>,
    /// Why it closed.
    pub reason: CloseReason,
    /// When it was retired.
    pub closed_at: Instant,
}

/// Result of [`SessionRegistry::get_or_create`].
#[derive(Debug, Clone)]
pub enum Lookup {
    /// A live session.
    Live {
        /// The session.
        session: Session,
        /// Whether this call created it.
        created: bool,
    },
    /// The id belongs to a recently closed session.
    Closed(ClosedSession),
}

/// Registry of live and recently closed sessions.
pub struct SessionRegistry {
    live: DashMap<SessionId, Session>,
    closed: DashMap<SessionId, ClosedSession>,
    /// Live entry count, tracked separately so it can be checked while an
    /// entry guard is held.
    live_count: AtomicUsize,
    max_sessions: usize,
    retention: Duration,
    spawner: Arc<dyn PtySpawner>,
    settings: SessionSettings,
    notices: mpsc::UnboundedSender<SessionNotice>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    ///
    /// # Arguments
    /// * `spawner` - Used to start the shell of every new session.
    /// * `settings` - Handed to every new session.
    /// * `max_sessions` - Upper bound on live sessions.
    /// * `retention` - How long tombstones of closed sessions are kept.
    /// * `notices` - Where sessions report evictions and closes.
    pub fn new(
        spawner: Arc<dyn PtySpawner>,
        settings: SessionSettings,
        max_sessions: usize,
        retention: Duration,
        notices: mpsc::UnboundedSender<SessionNotice>,
    ) -> Self {
        Self {
            live: DashMap::new(),
            closed: DashMap::new(),
            live_count: AtomicUsize::new(0),
            max_sessions,
            retention,
            spawner,
            settings,
            notices,
        }
    }

    /// Returns the settings handed to new sessions.
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Looks up a session, creating and starting it if needed.
    ///
    /// Without an id a fresh UUID is generated. When several callers race on
    /// the same id, exactly one creates the session and the others receive
    /// the same instance once it has started. A spawn failure removes the
    /// entry and is reported to every caller.
    pub async fn get_or_create(
        &self,
        id: Option<&str>,
        params: SessionParams,
    ) -> Result<Lookup, SessionError> {
        let id = match id {
            Some(id) => {
                validate_id(id)?;
                id.to_string()
            }
            None => Uuid::new_v4().to_string(),
        };

        if let Some(tombstone) = self.closed(&id) {
            return Ok(Lookup::Closed(tombstone));
        }

        let (session, created) = match self.live.entry(id.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                self.reserve_slot()?;
                let session = Session::new(
                    id.clone(),
                    params.owner.clone(),
                    params.size,
                    self.settings.clone(),
                    self.notices.clone(),
                );
                entry.insert(session.clone());
                (session, true)
            }
        };

        if !created {
            session.ready().await?;
            return Ok(Lookup::Live {
                session,
                created: false,
            });
        }

        let options = SpawnOptions {
            shell: params.shell,
            size: params.size,
            cwd: params.cwd,
            env: params.env,
        };
        if let Err(e) = session.start(Arc::clone(&self.spawner), options).await {
            self.remove_live(&session);
            return Err(e);
        }

        tracing::info!(
            session_id = %id,
            live = self.count(),
            "Created session"
        );
        Ok(Lookup::Live {
            session,
            created: true,
        })
    }

    fn reserve_slot(&self) -> Result<(), SessionError> {
        self.live_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < self.max_sessions).then_some(count + 1)
            })
            .map(|_| ())
            .map_err(|_| SessionError::LimitReached(self.max_sessions))
    }

    fn remove_live(&self, session: &Session) -> bool {
        let removed = self
            .live
            .remove_if(session.id(), |_, live| live.same(session))
            .is_some();
        if removed {
            self.live_count.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    /// Returns a live session.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.live.get(id).map(|entry| entry.value().clone())
    }

    /// Returns the tombstone of a recently closed session.
    pub fn closed(&self, id: &str) -> Option<ClosedSession> {
        let tombstone = self.closed.get(id).map(|entry| entry.value().clone())?;
        if tombstone.closed_at.elapsed() < self.retention {
            Some(tombstone)
        } else {
            self.closed.remove(id);
            None
        }
    }

    /// Removes a session and any tombstone for its id. No-op if absent.
    ///
    /// A live session is closed with `explicit_close` first, so the id only
    /// becomes reusable once its shell has been terminated.
    pub async fn remove(&self, id: &str) -> Option<Session> {
        let Some(session) = self.get(id) else {
            self.closed.remove(id);
            return None;
        };

        session.close(CloseReason::ExplicitClose).await;
        self.remove_live(&session);
        // The close notice may already have left a tombstone.
        self.closed.remove(id);

        tracing::debug!(session_id = %id, "Removed session");
        Some(session)
    }

    /// Moves a closed session to the tombstone map.
    ///
    /// Does nothing if the live entry for the id is no longer this instance.
    pub async fn retire(&self, session: &Session) -> bool {
        if !self.remove_live(session) {
            return false;
        }

        let reason = session
            .close_reason()
            .await
            .unwrap_or(CloseReason::ExplicitClose);
        self.closed.insert(
            session.id().clone(),
            ClosedSession {
                id: session.id().clone(),
                owner: session.owner().map(str::to_string),
                reason,
                closed_at: Instant::now(),
            },
        );

        tracing::debug!(session_id = %session.id(), reason = %reason, "Retired session");
        true
    }

    /// Snapshot of sessions that are not closing or closed, oldest first.
    pub async fn list_active(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Session> = self.live.iter().map(|e| e.value().clone()).collect();

        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            let summary = session.summary().await;
            if !summary.status.is_terminal() {
                summaries.push(summary);
            }
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        summaries
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.live_count.load(Ordering::SeqCst)
    }

    /// Number of retained tombstones.
    pub fn closed_count(&self) -> usize {
        self.closed.len()
    }

    /// Drops expired tombstones. Returns how many were dropped.
    pub fn prune_closed(&self) -> usize {
        let before = self.closed.len();
        self.closed
            .retain(|_, tombstone| tombstone.closed_at.elapsed() < self.retention);
        before.saturating_sub(self.closed.len())
    }

    /// Closes every live session.
    pub async fn close_all(&self, reason: CloseReason) {
        let sessions: Vec<Session> = self.live.iter().map(|e| e.value().clone()).collect();
        if sessions.is_empty() {
            return;
        }

        tracing::info!(count = sessions.len(), reason = %reason, "Closing all sessions");
        join_all(sessions.iter().map(|session| session.close(reason))).await;
        for session in &sessions {
            self.retire(session).await;
        }
    }
}

/// Checks a client-supplied session id: 1 to 128 characters from
/// `[A-Za-z0-9._-]`.
pub fn validate_id(id: &str) -> Result<(), SessionError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidId(id.to_string()))
    }
}
