//! Session state machine.
//!
//! A [`Session`] owns one PTY, the set of attached clients and a bounded
//! history of recent output. Its lifecycle is:
//!
//! ```text
//! Starting ──► Active ⇄ Idle ──► Closing ──► Closed
//!     │                              ▲
//!     └──────── spawn failure ───────┘ (straight to Closed)
//! ```
//!
//! Output from the PTY is appended to history and then fanned out to every
//! attached client over that client's bounded channel. All enqueues to
//! clients (ready snapshots, output, resize broadcasts, close notices) go
//! through a per-session `outbound` lock, so each client observes events in
//! emission order and a joining client's history snapshot lines up exactly
//! with the first chunk it receives live.
//!
//! Slow clients are handled by a bounded wait: each send first tries a
//! non-blocking enqueue, then waits up to `send_timeout`. Clients are served
//! concurrently, so one slow client delays the others by at most one
//! timeout. After `max_send_timeouts` consecutive timeouts the client is
//! evicted and the router is told through a [`SessionNotice`].

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::join_all;
use protocol::messages::{
    ErrorCode, ErrorMessage, TerminalClosed, TerminalOutput, TerminalReady, TerminalResized,
};
use protocol::{CloseReason, ServerMessage};
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::history::{HistoryBuffer, DEFAULT_HISTORY_LIMIT};
use super::ownership::{self, AttachDecision, OwnershipPolicy};
use super::pty::{PtyError, PtyEvent, PtyHandle, PtySpawner, SpawnOptions, TerminalSize};
use super::{ClientId, SessionError, SessionId};

/// With a zero idle timeout, how long a fresh session waits for its creator
/// to attach before it is closed.
const FIRST_ATTACH_GRACE: Duration = Duration::from_millis(500);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// The shell is being spawned.
    Starting,
    /// At least one client is attached.
    Active,
    /// No client is attached; the idle timer is running.
    Idle,
    /// Teardown in progress.
    Closing,
    /// Torn down.
    Closed,
}

impl SessionStatus {
    /// Lowercase name used in listings and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Active => "active",
            SessionStatus::Idle => "idle",
            SessionStatus::Closing => "closing",
            SessionStatus::Closed => "closed",
        }
    }

    /// Whether the session is closing or closed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Closing | SessionStatus::Closed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunables shared by every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// History cap in bytes.
    pub history_limit: usize,
    /// How long a session may stay without clients before it is closed.
    pub idle_timeout: Duration,
    /// Time between SIGHUP and SIGKILL when closing.
    pub terminate_grace: Duration,
    /// Longest a single send to one client may wait.
    pub send_timeout: Duration,
    /// Consecutive send timeouts before a client is evicted.
    pub max_send_timeouts: u32,
    /// Attach policy.
    pub policy: OwnershipPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            idle_timeout: Duration::from_secs(300),
            terminate_grace: Duration::from_secs(2),
            send_timeout: Duration::from_millis(250),
            max_send_timeouts: 3,
            policy: OwnershipPolicy::Shared,
        }
    }
}

/// Outbound side of a client connection, as seen by sessions.
#[derive(Debug, Clone)]
pub struct ClientSink {
    id: ClientId,
    identity: Option<String>,
    tx: mpsc::Sender<ServerMessage>,
}

impl ClientSink {
    /// Creates a sink for a client.
    pub fn new(id: ClientId, identity: Option<String>, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self { id, identity, tx }
    }

    /// Returns the client ID.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Returns the identity presented by the client, if any.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Enqueues a message without waiting. Returns false if the channel is
    /// full or closed.
    pub fn try_send(&self, message: ServerMessage) -> bool {
        self.tx.try_send(message).is_ok()
    }

    /// Enqueues a message, waiting for room. Returns false if the connection
    /// is gone.
    pub async fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(message).await.is_ok()
    }
}

/// Delivery statistics for one attached client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Messages enqueued successfully.
    pub messages_sent: u64,
    /// Total sends that timed out.
    pub send_timeouts: u64,
    /// Timeouts since the last successful send.
    pub consecutive_timeouts: u32,
}

/// Lifecycle events that other components must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    /// A client was force-detached because it could not keep up.
    ClientEvicted {
        /// Session the client was evicted from.
        session_id: SessionId,
        /// Evicted client.
        client_id: ClientId,
    },
    /// The session reached `Closed`.
    Closed {
        /// Session that closed.
        session_id: SessionId,
        /// Recorded owner.
        owner: Option<String>,
        /// Why it closed.
        reason: CloseReason,
    },
}

/// How an attach request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachStatus {
    /// First attach after creation.
    Created,
    /// Attach to an existing session.
    Resumed,
    /// Refused by the ownership policy.
    Denied,
    /// The session is closing or closed.
    AlreadyClosed,
}

/// Result of [`Session::attach`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOutcome {
    /// How the request was resolved.
    pub status: AttachStatus,
    /// History snapshot delivered with the ready message.
    pub history: Vec<u8>,
    /// Terminal size at attach time.
    pub size: TerminalSize,
    /// Whether the requester is the recorded owner.
    pub is_owner: bool,
}

/// Point-in-time view of a session for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Session identifier.
    pub id: SessionId,
    /// Current state.
    pub status: SessionStatus,
    /// Attached client count.
    pub clients: usize,
    /// Creation time (Unix epoch milliseconds).
    pub created_at: u64,
    /// Terminal size.
    pub size: TerminalSize,
    /// Recorded owner.
    pub owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Starting,
    Started,
    Failed(String),
    /// Closed before the shell finished starting.
    Closed,
}

struct Attached {
    sink: ClientSink,
    stats: ClientStats,
}

struct SessionState {
    status: SessionStatus,
    clients: HashMap<ClientId, Attached>,
    history: HistoryBuffer,
    /// No client has attached yet.
    fresh: bool,
    idle_timer: Option<JoinHandle<()>>,
    /// Bumped whenever the idle timer is armed or cancelled; a timer only
    /// fires if the epoch it was armed with is still current.
    idle_epoch: u64,
    close_reason: Option<CloseReason>,
}

struct SessionInner {
    id: SessionId,
    owner: Option<String>,
    created_at: u64,
    initial_size: TerminalSize,
    settings: SessionSettings,
    state: Mutex<SessionState>,
    /// Serializes every enqueue to clients. Lock order: `outbound`, then
    /// `state`.
    outbound: Mutex<()>,
    pty: OnceLock<PtyHandle>,
    ready: watch::Sender<Readiness>,
    notices: mpsc::UnboundedSender<SessionNotice>,
}

enum Delivery {
    Sent,
    TimedOut,
    Gone,
}

/// A shared, persistent terminal session.
///
/// Cloning is cheap; all clones refer to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("owner", &self.inner.owner)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates a session in the `Starting` state. Call [`start`](Self::start)
    /// to spawn the shell.
    pub fn new(
        id: SessionId,
        owner: Option<String>,
        size: TerminalSize,
        settings: SessionSettings,
        notices: mpsc::UnboundedSender<SessionNotice>,
    ) -> Self {
        let (ready, _) = watch::channel(Readiness::Starting);
        let history = HistoryBuffer::new(settings.history_limit);
        Self {
            inner: Arc::new(SessionInner {
                id,
                owner,
                created_at: now_millis(),
                initial_size: size,
                settings,
                state: Mutex::new(SessionState {
                    status: SessionStatus::Starting,
                    clients: HashMap::new(),
                    history,
                    fresh: true,
                    idle_timer: None,
                    idle_epoch: 0,
                    close_reason: None,
                }),
                outbound: Mutex::new(()),
                pty: OnceLock::new(),
                ready,
                notices,
            }),
        }
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    /// Returns the recorded owner identity.
    pub fn owner(&self) -> Option<&str> {
        self.inner.owner.as_deref()
    }

    /// Returns the creation time (Unix epoch milliseconds).
    pub fn created_at(&self) -> u64 {
        self.inner.created_at
    }

    /// Returns whether both handles refer to the same session.
    pub fn same(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> TerminalSize {
        self.inner
            .pty
            .get()
            .map(PtyHandle::size)
            .unwrap_or(self.inner.initial_size)
    }

    /// Returns the current state.
    pub async fn status(&self) -> SessionStatus {
        self.inner.state.lock().await.status
    }

    /// Returns why the session closed, once it has.
    pub async fn close_reason(&self) -> Option<CloseReason> {
        self.inner.state.lock().await.close_reason
    }

    /// Returns the number of attached clients.
    pub async fn client_count(&self) -> usize {
        self.inner.state.lock().await.clients.len()
    }

    /// Returns whether a client is attached.
    pub async fn is_attached(&self, client_id: &str) -> bool {
        self.inner.state.lock().await.clients.contains_key(client_id)
    }

    /// Returns delivery statistics for an attached client.
    pub async fn client_stats(&self, client_id: &str) -> Option<ClientStats> {
        self.inner
            .state
            .lock()
            .await
            .clients
            .get(client_id)
            .map(|attached| attached.stats.clone())
    }

    /// Returns a copy of the retained history.
    pub async fn history(&self) -> Vec<u8> {
        self.inner.state.lock().await.history.snapshot()
    }

    /// Returns a listing entry.
    pub async fn summary(&self) -> SessionSummary {
        let state = self.inner.state.lock().await;
        SessionSummary {
            id: self.inner.id.clone(),
            status: state.status,
            clients: state.clients.len(),
            created_at: self.inner.created_at,
            size: self.size(),
            owner: self.inner.owner.clone(),
        }
    }

    /// Spawns the shell and starts pumping its output.
    ///
    /// On failure the session goes straight to `Closed` and every caller
    /// waiting in [`ready`](Self::ready) receives the error.
    pub async fn start(
        &self,
        spawner: Arc<dyn PtySpawner>,
        options: SpawnOptions,
    ) -> Result<(), SessionError> {
        let spawned =
            tokio::task::spawn_blocking(move || PtyHandle::start(spawner.as_ref(), &options))
                .await
                .map_err(|e| PtyError::Spawn(e.to_string()))
                .and_then(|result| result);

        let pty = match spawned {
            Ok(pty) => pty,
            Err(e) => {
                self.fail(&e).await;
                return Err(e.into());
            }
        };

        let events = match pty.read_loop().await {
            Ok(events) => events,
            Err(e) => {
                pty.terminate(self.inner.settings.terminate_grace).await;
                self.fail(&e).await;
                return Err(e.into());
            }
        };

        let pid = pty.pid();
        {
            let mut state = self.inner.state.lock().await;
            if state.status.is_terminal() {
                drop(state);
                // Closed while spawning: nothing else will ever reap this shell.
                pty.terminate(self.inner.settings.terminate_grace).await;
                self.inner.ready.send_replace(Readiness::Closed);
                tracing::info!(
                    session_id = %self.inner.id,
                    pid = ?pid,
                    "Session closed during startup, shell terminated"
                );
                return Err(SessionError::Closed(self.inner.id.clone()));
            }
            if self.inner.pty.set(pty).is_err() {
                return Err(PtyError::Spawn("session already started".to_string()).into());
            }
            state.status = SessionStatus::Idle;
            // Covers a creator that goes away before attaching.
            let timeout = if self.inner.settings.idle_timeout.is_zero() {
                FIRST_ATTACH_GRACE
            } else {
                self.inner.settings.idle_timeout
            };
            self.arm_idle_timer(&mut state, timeout);
        }
        self.inner.ready.send_replace(Readiness::Started);

        tokio::spawn(self.clone().pump_output(events));

        tracing::info!(
            session_id = %self.inner.id,
            pid = ?pid,
            owner = ?self.inner.owner,
            "Session started"
        );
        Ok(())
    }

    async fn fail(&self, error: &PtyError) {
        {
            let mut state = self.inner.state.lock().await;
            if !state.status.is_terminal() {
                state.close_reason = Some(CloseReason::ProcessExited);
            }
            state.status = SessionStatus::Closed;
        }
        self.inner
            .ready
            .send_replace(Readiness::Failed(error.to_string()));
        tracing::warn!(session_id = %self.inner.id, error = %error, "Session failed to start");
    }

    /// Waits until the session has finished starting.
    pub async fn ready(&self) -> Result<(), SessionError> {
        let mut rx = self.inner.ready.subscribe();
        let readiness = match rx.wait_for(|r| *r != Readiness::Starting).await {
            Ok(readiness) => readiness.clone(),
            Err(_) => return Err(SessionError::Closed(self.inner.id.clone())),
        };
        match readiness {
            Readiness::Failed(message) => Err(PtyError::Spawn(message).into()),
            Readiness::Closed => Err(SessionError::Closed(self.inner.id.clone())),
            Readiness::Starting | Readiness::Started => Ok(()),
        }
    }

    /// Attaches a client.
    ///
    /// On success the client is sent `terminal_ready` with the full history
    /// snapshot before any further output. Denied and already-closed
    /// outcomes send nothing; the caller reports them.
    pub async fn attach(&self, sink: ClientSink) -> AttachOutcome {
        // A failed start leaves the session Closed, which resolves below.
        let _ = self.ready().await;

        let _outbound = self.inner.outbound.lock().await;
        let size = self.size();
        let is_owner = ownership::is_owner(self.owner(), sink.identity());

        let (status, history) = {
            let mut state = self.inner.state.lock().await;
            match ownership::resolve(
                state.status,
                self.owner(),
                sink.identity(),
                self.inner.settings.policy,
            ) {
                AttachDecision::Deny => {
                    tracing::info!(
                        session_id = %self.inner.id,
                        client_id = %sink.id(),
                        "Attach denied by ownership policy"
                    );
                    return AttachOutcome {
                        status: AttachStatus::Denied,
                        history: Vec::new(),
                        size,
                        is_owner,
                    };
                }
                AttachDecision::AlreadyClosed { is_owner } => {
                    return AttachOutcome {
                        status: AttachStatus::AlreadyClosed,
                        history: Vec::new(),
                        size,
                        is_owner,
                    };
                }
                AttachDecision::Attach => {}
            }

            let status = if std::mem::replace(&mut state.fresh, false) {
                AttachStatus::Created
            } else {
                AttachStatus::Resumed
            };

            state.clients.insert(
                sink.id().clone(),
                Attached {
                    sink: sink.clone(),
                    stats: ClientStats::default(),
                },
            );
            if state.status == SessionStatus::Idle {
                state.status = SessionStatus::Active;
            }
            cancel_idle_timer(&mut state);

            (status, state.history.snapshot())
        };

        let ready = ServerMessage::TerminalReady(TerminalReady {
            session_id: self.inner.id.clone(),
            resumed: status == AttachStatus::Resumed,
            history: history.clone(),
            cols: size.cols,
            rows: size.rows,
        });
        if let Delivery::Gone | Delivery::TimedOut =
            deliver(&sink, ready, self.inner.settings.send_timeout).await
        {
            tracing::debug!(
                session_id = %self.inner.id,
                client_id = %sink.id(),
                "Could not deliver ready message"
            );
        }

        tracing::info!(
            session_id = %self.inner.id,
            client_id = %sink.id(),
            status = ?status,
            history_bytes = history.len(),
            "Client attached"
        );

        AttachOutcome {
            status,
            history,
            size,
            is_owner,
        }
    }

    /// Detaches a client. Returns false if it was not attached.
    ///
    /// When the last client leaves, the session becomes `Idle` and the idle
    /// timer starts.
    pub async fn detach(&self, client_id: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.clients.remove(client_id).is_none() {
            return false;
        }
        tracing::debug!(session_id = %self.inner.id, client_id = %client_id, "Client detached");
        self.enter_idle_if_empty(&mut state);
        true
    }

    /// Forwards input to the shell, verbatim.
    ///
    /// A write failure means the PTY is gone: the session is closed with
    /// `process_exited` in the background and the error is returned.
    pub async fn input(&self, data: &[u8]) -> Result<(), SessionError> {
        let pty = self.live_pty().await?;
        if let Err(e) = pty.write(data).await {
            tracing::warn!(session_id = %self.inner.id, error = %e, "PTY write failed");
            let session = self.clone();
            tokio::spawn(async move {
                session.close(CloseReason::ProcessExited).await;
            });
            return Err(e.into());
        }
        Ok(())
    }

    /// Resizes the terminal and tells the other attached clients.
    ///
    /// The last request wins. A failed resize leaves the session running.
    pub async fn resize(
        &self,
        cols: u16,
        rows: u16,
        requester: &str,
    ) -> Result<TerminalSize, SessionError> {
        let pty = self.live_pty().await?;
        pty.resize(cols, rows).await?;
        let size = pty.size();

        let _outbound = self.inner.outbound.lock().await;
        let others: Vec<ClientSink> = {
            let state = self.inner.state.lock().await;
            state
                .clients
                .values()
                .filter(|attached| attached.sink.id() != requester)
                .map(|attached| attached.sink.clone())
                .collect()
        };
        let message = ServerMessage::TerminalResized(TerminalResized {
            session_id: self.inner.id.clone(),
            cols: size.cols,
            rows: size.rows,
        });
        self.deliver_all(others, message).await;

        tracing::debug!(
            session_id = %self.inner.id,
            cols = size.cols,
            rows = size.rows,
            "Resized session"
        );
        Ok(size)
    }

    /// Closes the session for everyone.
    ///
    /// Terminates the shell, sends `terminal_closed` to every attached
    /// client and emits [`SessionNotice::Closed`]. Returns false if the
    /// session was already closing or closed.
    pub async fn close(&self, reason: CloseReason) -> bool {
        self.close_inner(reason, None).await
    }

    async fn close_inner(&self, reason: CloseReason, idle_epoch: Option<u64>) -> bool {
        {
            let mut state = self.inner.state.lock().await;
            if state.status.is_terminal() {
                return false;
            }
            if let Some(epoch) = idle_epoch {
                if state.status != SessionStatus::Idle || state.idle_epoch != epoch {
                    return false;
                }
            }
            state.status = SessionStatus::Closing;
            state.close_reason = Some(reason);
            // Not aborted: this may be the idle timer task itself.
            state.idle_timer.take();
            state.idle_epoch += 1;
        }

        if let Some(pty) = self.inner.pty.get() {
            pty.terminate(self.inner.settings.terminate_grace).await;
        }

        let _outbound = self.inner.outbound.lock().await;
        let clients = {
            let mut state = self.inner.state.lock().await;
            std::mem::take(&mut state.clients)
        };

        let timeout = self.inner.settings.send_timeout;
        join_all(clients.into_values().map(|attached| {
            let message = ServerMessage::TerminalClosed(TerminalClosed {
                session_id: self.inner.id.clone(),
                reason,
                is_owner: ownership::is_owner(self.owner(), attached.sink.identity()),
            });
            async move { deliver(&attached.sink, message, timeout).await }
        }))
        .await;

        self.inner.state.lock().await.status = SessionStatus::Closed;

        let _ = self.inner.notices.send(SessionNotice::Closed {
            session_id: self.inner.id.clone(),
            owner: self.inner.owner.clone(),
            reason,
        });

        tracing::info!(session_id = %self.inner.id, reason = %reason, "Session closed");
        true
    }

    async fn live_pty(&self) -> Result<&PtyHandle, SessionError> {
        if self.inner.state.lock().await.status.is_terminal() {
            return Err(SessionError::Closed(self.inner.id.clone()));
        }
        self.inner
            .pty
            .get()
            .ok_or_else(|| SessionError::Closed(self.inner.id.clone()))
    }

    async fn pump_output(self, mut events: mpsc::Receiver<PtyEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                PtyEvent::Output(chunk) => self.fan_out(chunk).await,
                PtyEvent::Eof => {
                    tracing::info!(session_id = %self.inner.id, "PTY EOF - process exited");
                    break;
                }
                PtyEvent::Error(e) => {
                    tracing::error!(
                        session_id = %self.inner.id,
                        error = %e,
                        "Error reading from PTY"
                    );
                    break;
                }
            }
        }

        self.close(CloseReason::ProcessExited).await;
    }

    async fn fan_out(&self, chunk: Vec<u8>) {
        let _outbound = self.inner.outbound.lock().await;
        let sinks: Vec<ClientSink> = {
            let mut state = self.inner.state.lock().await;
            if state.status.is_terminal() {
                return;
            }
            state.history.push(&chunk);
            state
                .clients
                .values()
                .map(|attached| attached.sink.clone())
                .collect()
        };

        let message = ServerMessage::TerminalOutput(TerminalOutput {
            session_id: self.inner.id.clone(),
            data: chunk,
        });
        self.deliver_all(sinks, message).await;
    }

    /// Sends `message` to every sink concurrently and records the results.
    /// Callers hold the `outbound` lock.
    async fn deliver_all(&self, sinks: Vec<ClientSink>, message: ServerMessage) {
        if sinks.is_empty() {
            return;
        }

        let timeout = self.inner.settings.send_timeout;
        let results = join_all(sinks.into_iter().map(|sink| {
            let message = message.clone();
            async move {
                let delivery = deliver(&sink, message, timeout).await;
                (sink, delivery)
            }
        }))
        .await;

        let mut evicted = Vec::new();
        {
            let mut state = self.inner.state.lock().await;
            for (sink, delivery) in results {
                let Some(attached) = state.clients.get_mut(sink.id()) else {
                    continue;
                };
                let evict = match delivery {
                    Delivery::Sent => {
                        attached.stats.messages_sent += 1;
                        attached.stats.consecutive_timeouts = 0;
                        false
                    }
                    Delivery::TimedOut => {
                        attached.stats.send_timeouts += 1;
                        attached.stats.consecutive_timeouts += 1;
                        tracing::warn!(
                            session_id = %self.inner.id,
                            client_id = %sink.id(),
                            consecutive = attached.stats.consecutive_timeouts,
                            "Client is backpressured"
                        );
                        attached.stats.consecutive_timeouts >= self.inner.settings.max_send_timeouts
                    }
                    Delivery::Gone => true,
                };
                if evict {
                    state.clients.remove(sink.id());
                    evicted.push(sink);
                }
            }
            if !evicted.is_empty() {
                self.enter_idle_if_empty(&mut state);
            }
        }

        for sink in evicted {
            tracing::warn!(
                session_id = %self.inner.id,
                client_id = %sink.id(),
                "Evicting slow client"
            );
            sink.try_send(ServerMessage::Error(ErrorMessage {
                code: ErrorCode::SlowConsumer,
                message: "client could not keep up with terminal output and was detached"
                    .to_string(),
                context: Some(self.inner.id.clone()),
                recoverable: true,
            }));
            let _ = self.inner.notices.send(SessionNotice::ClientEvicted {
                session_id: self.inner.id.clone(),
                client_id: sink.id().clone(),
            });
        }
    }

    fn enter_idle_if_empty(&self, state: &mut SessionState) {
        if state.clients.is_empty() && state.status == SessionStatus::Active {
            state.status = SessionStatus::Idle;
            self.arm_idle_timer(state, self.inner.settings.idle_timeout);
        }
    }

    fn arm_idle_timer(&self, state: &mut SessionState, timeout: Duration) {
        cancel_idle_timer(state);
        let epoch = state.idle_epoch;
        let session = self.clone();

        state.idle_timer = Some(tokio::spawn(async move {
            if !timeout.is_zero() {
                tokio::time::sleep(timeout).await;
            }
            if session
                .close_inner(CloseReason::IdleTimeout, Some(epoch))
                .await
            {
                tracing::info!(session_id = %session.inner.id, "Idle session timed out");
            }
        }));
    }
}

fn cancel_idle_timer(state: &mut SessionState) {
    if let Some(timer) = state.idle_timer.take() {
        timer.abort();
    }
    state.idle_epoch += 1;
}

async fn deliver(sink: &ClientSink, message: ServerMessage, timeout: Duration) -> Delivery {
    match sink.tx.try_send(message) {
        Ok(()) => Delivery::Sent,
        Err(TrySendError::Full(message)) => match sink.tx.send_timeout(message, timeout).await {
            Ok(()) => Delivery::Sent,
            Err(SendTimeoutError::Timeout(_)) => Delivery::TimedOut,
            Err(SendTimeoutError::Closed(_)) => Delivery::Gone,
        },
        Err(TrySendError::Closed(_)) => Delivery::Gone,
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{sink, FakeSpawner};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn settings() -> SessionSettings {
        SessionSettings {
            idle_timeout: Duration::from_secs(60),
            terminate_grace: Duration::from_millis(50),
            send_timeout: Duration::from_millis(20),
            ..SessionSettings::default()
        }
    }

    async fn started(
        spawner: &FakeSpawner,
        owner: Option<&str>,
        settings: SessionSettings,
    ) -> (Session, mpsc::UnboundedReceiver<SessionNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(
            "S1".to_string(),
            owner.map(str::to_string),
            TerminalSize::default(),
            settings,
            tx,
        );
        session
            .start(Arc::new(spawner.clone()), spawner.options())
            .await
            .unwrap();
        (session, rx)
    }

    async fn next(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    async fn next_output(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<u8> {
        match next(rx).await {
            ServerMessage::TerminalOutput(out) => out.data,
            other => panic!("expected terminal_output, got {other:?}"),
        }
    }

    async fn wait_for_status(session: &Session, status: SessionStatus) {
        for _ in 0..200 {
            if session.status().await == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never reached {status}");
    }

    #[tokio::test]
    async fn test_create_input_output() {
        let spawner = FakeSpawner::new();
        let (session, _notices) = started(&spawner, Some("A"), settings()).await;
        let control = spawner.control(0).unwrap();

        let (c1, mut rx1) = sink("c1", Some("A"), 16);
        let outcome = session.attach(c1).await;
        assert_eq!(outcome.status, AttachStatus::Created);
        assert!(outcome.is_owner);
        match next(&mut rx1).await {
            ServerMessage::TerminalReady(ready) => {
                assert_eq!(ready.session_id, "S1");
                assert!(!ready.resumed);
                assert!(ready.history.is_empty());
                assert_eq!((ready.cols, ready.rows), (80, 24));
            }
            other => panic!("expected terminal_ready, got {other:?}"),
        }
        assert_eq!(session.status().await, SessionStatus::Active);

        session.input(b"ls\n").await.unwrap();
        assert_eq!(control.written(), b"ls\n");

        control.emit(b"file.txt\n");
        assert_eq!(next_output(&mut rx1).await, b"file.txt\n");
    }

    #[tokio::test]
    async fn test_output_order_and_late_joiner_history() {
        let spawner = FakeSpawner::new();
        let (session, _notices) = started(&spawner, None, settings()).await;
        let control = spawner.control(0).unwrap();

        let (c1, mut rx1) = sink("c1", None, 64);
        session.attach(c1).await;
        next(&mut rx1).await;

        for chunk in [&b"a"[..], b"b", b"c"] {
            control.emit(chunk);
        }
        assert_eq!(next_output(&mut rx1).await, b"a");
        assert_eq!(next_output(&mut rx1).await, b"b");
        assert_eq!(next_output(&mut rx1).await, b"c");

        let (c2, mut rx2) = sink("c2", None, 64);
        let outcome = session.attach(c2).await;
        assert_eq!(outcome.status, AttachStatus::Resumed);
        assert_eq!(outcome.history, b"abc");
        match next(&mut rx2).await {
            ServerMessage::TerminalReady(ready) => {
                assert!(ready.resumed);
                assert_eq!(ready.history, b"abc");
            }
            other => panic!("expected terminal_ready, got {other:?}"),
        }

        control.emit(b"d");
        assert_eq!(next_output(&mut rx1).await, b"d");
        assert_eq!(next_output(&mut rx2).await, b"d");
    }

    #[tokio::test]
    async fn test_detach_goes_idle_and_resume_restores_history() {
        let spawner = FakeSpawner::new();
        let (session, _notices) = started(&spawner, Some("A"), settings()).await;
        let control = spawner.control(0).unwrap();

        let (c1, mut rx1) = sink("c1", Some("A"), 16);
        session.attach(c1).await;
        next(&mut rx1).await;

        assert!(session.detach("c1").await);
        assert!(!session.detach("c1").await);
        assert_eq!(session.status().await, SessionStatus::Idle);

        control.emit(b"while you were away\n");
        for _ in 0..100 {
            if !session.history().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (c2, mut rx2) = sink("c2", Some("A"), 16);
        let outcome = session.attach(c2).await;
        assert_eq!(outcome.status, AttachStatus::Resumed);
        assert_eq!(outcome.history, b"while you were away\n");
        assert_eq!(session.status().await, SessionStatus::Active);
        assert!(matches!(next(&mut rx2).await, ServerMessage::TerminalReady(_)));
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_and_reports_ownership() {
        let spawner = FakeSpawner::new();
        let mut fast = settings();
        fast.idle_timeout = Duration::from_millis(50);
        let (session, mut notices) = started(&spawner, Some("A"), fast).await;
        let control = spawner.control(0).unwrap();

        let (c1, mut rx1) = sink("c1", Some("A"), 16);
        session.attach(c1).await;
        next(&mut rx1).await;
        session.detach("c1").await;

        wait_for_status(&session, SessionStatus::Closed).await;
        assert_eq!(session.close_reason().await, Some(CloseReason::IdleTimeout));
        assert_eq!(control.terminate_calls(), 1);

        let notice = timeout(WAIT, notices.recv()).await.unwrap().unwrap();
        assert_eq!(
            notice,
            SessionNotice::Closed {
                session_id: "S1".to_string(),
                owner: Some("A".to_string()),
                reason: CloseReason::IdleTimeout,
            }
        );

        let (owner, _rx) = sink("c2", Some("A"), 16);
        let outcome = session.attach(owner).await;
        assert_eq!(outcome.status, AttachStatus::AlreadyClosed);
        assert!(outcome.is_owner);

        let (stranger, _rx) = sink("c3", Some("B"), 16);
        let outcome = session.attach(stranger).await;
        assert_eq!(outcome.status, AttachStatus::AlreadyClosed);
        assert!(!outcome.is_owner);
    }

    #[tokio::test]
    async fn test_reattach_cancels_idle_timer() {
        let spawner = FakeSpawner::new();
        let mut fast = settings();
        fast.idle_timeout = Duration::from_millis(100);
        let (session, _notices) = started(&spawner, None, fast).await;

        let (c1, _rx1) = sink("c1", None, 16);
        session.attach(c1).await;
        session.detach("c1").await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let (c2, _rx2) = sink("c2", None, 16);
        session.attach(c2).await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(session.status().await, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_zero_idle_timeout_closes_on_last_detach() {
        let spawner = FakeSpawner::new();
        let mut zero = settings();
        zero.idle_timeout = Duration::ZERO;
        let (session, _notices) = started(&spawner, None, zero).await;

        let (c1, _rx1) = sink("c1", None, 16);
        assert_eq!(session.attach(c1).await.status, AttachStatus::Created);
        session.detach("c1").await;

        wait_for_status(&session, SessionStatus::Closed).await;
        assert_eq!(session.close_reason().await, Some(CloseReason::IdleTimeout));
    }

    #[tokio::test]
    async fn test_zero_idle_timeout_closes_session_nobody_attached_to() {
        let spawner = FakeSpawner::new();
        let mut zero = settings();
        zero.idle_timeout = Duration::ZERO;
        let (session, mut notices) = started(&spawner, None, zero).await;
        assert_eq!(session.status().await, SessionStatus::Idle);

        wait_for_status(&session, SessionStatus::Closed).await;
        assert_eq!(session.close_reason().await, Some(CloseReason::IdleTimeout));
        assert_eq!(spawner.control(0).unwrap().terminate_calls(), 1);
        assert!(matches!(
            timeout(WAIT, notices.recv()).await.unwrap(),
            Some(SessionNotice::Closed {
                reason: CloseReason::IdleTimeout,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_slow_consumer_is_evicted() {
        let spawner = FakeSpawner::new();
        let (session, mut notices) = started(&spawner, None, settings()).await;
        let control = spawner.control(0).unwrap();

        // c1 never reads; its single slot is taken by terminal_ready.
        let (c1, _rx1) = sink("c1", None, 1);
        let (c2, mut rx2) = sink("c2", None, 64);
        session.attach(c1).await;
        session.attach(c2).await;
        next(&mut rx2).await;

        for i in 0..6u8 {
            control.emit(&[b'0' + i]);
        }
        for i in 0..6u8 {
            assert_eq!(next_output(&mut rx2).await, vec![b'0' + i]);
        }

        let notice = timeout(WAIT, notices.recv()).await.unwrap().unwrap();
        assert_eq!(
            notice,
            SessionNotice::ClientEvicted {
                session_id: "S1".to_string(),
                client_id: "c1".to_string(),
            }
        );
        assert!(!session.is_attached("c1").await);
        assert!(session.is_attached("c2").await);
        assert_eq!(session.status().await, SessionStatus::Active);

        let stats = session.client_stats("c2").await.unwrap();
        assert_eq!(stats.consecutive_timeouts, 0);
        assert!(stats.messages_sent >= 6);
    }

    #[tokio::test]
    async fn test_disconnected_client_is_dropped_from_fan_out() {
        let spawner = FakeSpawner::new();
        let (session, mut notices) = started(&spawner, None, settings()).await;
        let control = spawner.control(0).unwrap();

        let (c1, rx1) = sink("c1", None, 16);
        session.attach(c1).await;
        drop(rx1);

        control.emit(b"x");
        let notice = timeout(WAIT, notices.recv()).await.unwrap().unwrap();
        assert!(matches!(notice, SessionNotice::ClientEvicted { .. }));
        wait_for_status(&session, SessionStatus::Idle).await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_notifies_clients() {
        let spawner = FakeSpawner::new();
        let (session, mut notices) = started(&spawner, Some("A"), settings()).await;
        let control = spawner.control(0).unwrap();

        let (owner, mut rx_owner) = sink("c1", Some("A"), 16);
        let (viewer, mut rx_viewer) = sink("c2", None, 16);
        session.attach(owner).await;
        session.attach(viewer).await;
        next(&mut rx_owner).await;
        next(&mut rx_viewer).await;

        assert!(session.close(CloseReason::ExplicitClose).await);
        assert!(!session.close(CloseReason::ExplicitClose).await);
        assert_eq!(session.status().await, SessionStatus::Closed);
        assert_eq!(session.client_count().await, 0);
        assert_eq!(control.terminate_calls(), 1);

        for (rx, expect_owner) in [(&mut rx_owner, true), (&mut rx_viewer, false)] {
            match next(rx).await {
                ServerMessage::TerminalClosed(closed) => {
                    assert_eq!(closed.reason, CloseReason::ExplicitClose);
                    assert_eq!(closed.is_owner, expect_owner);
                }
                other => panic!("expected terminal_closed, got {other:?}"),
            }
        }

        let closed_notices = std::iter::from_fn(|| notices.try_recv().ok())
            .filter(|n| matches!(n, SessionNotice::Closed { .. }))
            .count();
        assert_eq!(closed_notices, 1);

        assert!(matches!(session.input(b"x").await, Err(SessionError::Closed(_))));
    }

    #[tokio::test]
    async fn test_process_exit_closes_session() {
        let spawner = FakeSpawner::new();
        let (session, _notices) = started(&spawner, None, settings()).await;
        let control = spawner.control(0).unwrap();

        let (c1, mut rx1) = sink("c1", None, 16);
        session.attach(c1).await;
        next(&mut rx1).await;

        control.exit();
        match next(&mut rx1).await {
            ServerMessage::TerminalClosed(closed) => {
                assert_eq!(closed.reason, CloseReason::ProcessExited);
            }
            other => panic!("expected terminal_closed, got {other:?}"),
        }
        wait_for_status(&session, SessionStatus::Closed).await;
    }

    #[tokio::test]
    async fn test_resize_broadcasts_to_others() {
        let spawner = FakeSpawner::new();
        let (session, _notices) = started(&spawner, None, settings()).await;
        let control = spawner.control(0).unwrap();

        let (c1, mut rx1) = sink("c1", None, 16);
        let (c2, mut rx2) = sink("c2", None, 16);
        session.attach(c1).await;
        session.attach(c2).await;
        next(&mut rx1).await;
        next(&mut rx2).await;

        let size = session.resize(120, 40, "c1").await.unwrap();
        assert_eq!(size, TerminalSize { cols: 120, rows: 40 });
        assert_eq!(session.size(), size);
        assert_eq!(control.resizes(), vec![size]);

        match next(&mut rx2).await {
            ServerMessage::TerminalResized(resized) => {
                assert_eq!((resized.cols, resized.rows), (120, 40));
            }
            other => panic!("expected terminal_resized, got {other:?}"),
        }
        assert!(rx1.try_recv().is_err());

        let err = session.resize(0, 10, "c1").await.unwrap_err();
        assert!(matches!(err, SessionError::Pty(PtyError::InvalidSize { .. })));
        assert_eq!(session.size(), size);
        assert_eq!(session.status().await, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_strict_policy_denies_other_identity() {
        let spawner = FakeSpawner::new();
        let mut strict = settings();
        strict.policy = OwnershipPolicy::Strict;
        let (session, _notices) = started(&spawner, Some("A"), strict).await;

        let (owner, _rx1) = sink("c1", Some("A"), 16);
        assert_eq!(session.attach(owner).await.status, AttachStatus::Created);

        let (intruder, mut rx2) = sink("c2", Some("B"), 16);
        let outcome = session.attach(intruder).await;
        assert_eq!(outcome.status, AttachStatus::Denied);
        assert!(!session.is_attached("c2").await);
        assert!(rx2.try_recv().is_err());

        let (anonymous, _rx3) = sink("c3", None, 16);
        assert_eq!(session.attach(anonymous).await.status, AttachStatus::Resumed);
    }

    #[tokio::test]
    async fn test_spawn_failure_closes_session() {
        let spawner = FakeSpawner::failing();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::new(
            "S1".to_string(),
            None,
            TerminalSize::default(),
            settings(),
            tx,
        );

        let result = session
            .start(Arc::new(spawner.clone()), spawner.options())
            .await;
        assert!(matches!(result, Err(SessionError::Pty(PtyError::Spawn(_)))));
        assert_eq!(session.status().await, SessionStatus::Closed);
        assert!(session.ready().await.is_err());

        let (c1, _rx1) = sink("c1", None, 16);
        assert_eq!(session.attach(c1).await.status, AttachStatus::AlreadyClosed);
    }

    #[tokio::test]
    async fn test_close_during_start_terminates_shell() {
        let spawner = FakeSpawner::slow(Duration::from_millis(200));
        let (tx, mut notices) = mpsc::unbounded_channel();
        let session = Session::new(
            "S1".to_string(),
            None,
            TerminalSize::default(),
            settings(),
            tx,
        );

        let starting = {
            let session = session.clone();
            let spawner = spawner.clone();
            tokio::spawn(async move {
                session
                    .start(Arc::new(spawner.clone()), spawner.options())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.status().await, SessionStatus::Starting);

        assert!(session.close(CloseReason::ExplicitClose).await);
        assert_eq!(session.status().await, SessionStatus::Closed);

        let result = starting.await.unwrap();
        assert!(matches!(result, Err(SessionError::Closed(_))));
        assert_eq!(session.status().await, SessionStatus::Closed);
        assert_eq!(session.close_reason().await, Some(CloseReason::ExplicitClose));
        assert_eq!(spawner.control(0).unwrap().terminate_calls(), 1);
        assert!(matches!(session.ready().await, Err(SessionError::Closed(_))));
        assert!(session.input(b"x").await.is_err());

        let (c1, _rx1) = sink("c1", None, 16);
        assert_eq!(session.attach(c1).await.status, AttachStatus::AlreadyClosed);

        // Exactly one close notice.
        assert!(matches!(notices.recv().await, Some(SessionNotice::Closed { .. })));
        assert!(notices.try_recv().is_err());
    }
}
