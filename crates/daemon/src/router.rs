//! Message router for dispatching incoming messages to the session layer.
//!
//! This module provides the `MessageRouter` struct that receives decoded
//! [`ClientMessage`]s from a connection and turns them into operations on the
//! [`SessionRegistry`], individual [`Session`]s and the [`ClientRegistry`].
//! It also consumes [`SessionNotice`]s so that evictions and closes made by
//! sessions on their own are reflected in the client links.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use protocol::messages::{
    ErrorCode, ErrorMessage, Pong, SessionEntry, SessionList, TerminalClose, TerminalClosed,
    TerminalCreate, TerminalDenied, TerminalDetach, TerminalInput, TerminalResize,
};
use protocol::{ClientMessage, CloseReason, ServerMessage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::ownership;
use crate::session::{
    AttachStatus, ClientRegistry, ClientSink, Lookup, PtyError, Session, SessionError,
    SessionNotice, SessionParams, SessionRegistry, SessionStatus, TerminalSize,
};

/// Result type for router operations.
pub type RouterResult = Result<Option<ServerMessage>, RouterError>;

/// Errors that can occur during message routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Session-related error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// The client addressed a session it is not attached to.
    #[error("not attached to session: {0}")]
    NotAttached(String),

    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RouterError {
    /// Convert the error to a protocol ErrorMessage.
    pub fn to_error_message(&self, context: Option<String>) -> ErrorMessage {
        let (code, recoverable) = match self {
            RouterError::Session(e) => match e {
                SessionError::NotFound(_) => (ErrorCode::NotFound, false),
                SessionError::Closed(_) => (ErrorCode::NotFound, false),
                SessionError::InvalidId(_) => (ErrorCode::InvalidRequest, false),
                SessionError::LimitReached(_) => (ErrorCode::LimitReached, true),
                SessionError::Pty(PtyError::InvalidSize { .. }) => {
                    (ErrorCode::InvalidRequest, false)
                }
                SessionError::Pty(_) => (ErrorCode::InternalError, true),
            },
            RouterError::NotAttached(_) => (ErrorCode::NotAttached, false),
            RouterError::InvalidRequest(_) => (ErrorCode::InvalidRequest, false),
        };

        ErrorMessage {
            code,
            message: self.to_string(),
            context,
            recoverable,
        }
    }
}

/// Values used for fields a `terminal_create` request leaves out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDefaults {
    /// Shell to run.
    pub shell: String,
    /// Terminal columns.
    pub cols: u16,
    /// Terminal rows.
    pub rows: u16,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Environment applied before the request's own variables.
    pub env: BTreeMap<String, String>,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        Self {
            shell: crate::session::pty::detect_shell(),
            cols: 80,
            rows: 24,
            cwd: None,
            env,
        }
    }
}

/// Message router that dispatches client messages to the session layer.
///
/// The router is the only component that touches both registries. It holds
/// no per-connection state; connections identify themselves with their
/// [`ClientSink`].
pub struct MessageRouter {
    /// Live sessions and tombstones.
    sessions: Arc<SessionRegistry>,
    /// Client to session links.
    clients: Arc<ClientRegistry>,
    /// Defaults for new sessions.
    defaults: SessionDefaults,
}

impl MessageRouter {
    /// Create a new message router with the given dependencies.
    pub fn new(
        sessions: Arc<SessionRegistry>,
        clients: Arc<ClientRegistry>,
        defaults: SessionDefaults,
    ) -> Self {
        Self {
            sessions,
            clients,
            defaults,
        }
    }

    /// Returns the session registry.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Returns the client registry.
    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    /// Registers a newly connected client.
    pub async fn connect(&self, client: &ClientSink) {
        self.clients
            .register(client.id(), client.identity().map(str::to_string))
            .await;
        info!(
            client_id = %client.id(),
            identity = ?client.identity(),
            "Client connected"
        );
    }

    /// Forgets a client, detaching it from every session it was linked to.
    pub async fn disconnect(&self, client_id: &str) {
        let sessions = self.clients.unregister(client_id).await;
        for session_id in &sessions {
            if let Some(session) = self.sessions.get(session_id) {
                session.detach(client_id).await;
            }
        }
        info!(
            client_id = %client_id,
            detached = sessions.len(),
            "Client disconnected"
        );
    }

    /// Routes a message and converts any failure into an `error` reply.
    pub async fn handle(&self, client: &ClientSink, message: ClientMessage) -> Option<ServerMessage> {
        let context = session_context(&message);
        match self.route(client, message).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(client_id = %client.id(), error = %e, "Request failed");
                Some(ServerMessage::Error(e.to_error_message(context)))
            }
        }
    }

    /// Routes a message to the appropriate handler.
    ///
    /// Returns the direct reply, if any. Messages that the session delivers
    /// itself (such as `terminal_ready`) are not returned here.
    pub async fn route(&self, client: &ClientSink, message: ClientMessage) -> RouterResult {
        debug!(client_id = %client.id(), ?message, "Routing message");

        match message {
            ClientMessage::TerminalCreate(req) => self.handle_create(client, req).await,
            ClientMessage::TerminalInput(req) => self.handle_input(client, req).await,
            ClientMessage::TerminalResize(req) => self.handle_resize(client, req).await,
            ClientMessage::TerminalDetach(req) => self.handle_detach(client, req).await,
            ClientMessage::TerminalClose(req) => self.handle_close(client, req).await,
            ClientMessage::ListSessions => self.handle_list().await,
            ClientMessage::Ping(ping) => Ok(Some(ServerMessage::Pong(Pong {
                timestamp: ping.timestamp,
            }))),
        }
    }

    // =========================================================================
    // Session Handlers
    // =========================================================================

    async fn handle_create(&self, client: &ClientSink, req: TerminalCreate) -> RouterResult {
        let size = TerminalSize::new(
            req.cols.unwrap_or(self.defaults.cols),
            req.rows.unwrap_or(self.defaults.rows),
        )
        .map_err(SessionError::from)?;

        let mut env = self.defaults.env.clone();
        env.extend(req.env);

        let params = SessionParams {
            owner: client.identity().map(str::to_string),
            size,
            shell: req.shell.unwrap_or_else(|| self.defaults.shell.clone()),
            cwd: req.cwd.map(PathBuf::from).or_else(|| self.defaults.cwd.clone()),
            env: env.into_iter().collect(),
        };

        let session = match self
            .sessions
            .get_or_create(req.session_id.as_deref(), params)
            .await?
        {
            Lookup::Live { session, .. } => session,
            Lookup::Closed(tombstone) => {
                info!(
                    client_id = %client.id(),
                    session_id = %tombstone.id,
                    "Attach to closed session"
                );
                return Ok(Some(ServerMessage::TerminalClosed(TerminalClosed {
                    is_owner: ownership::is_owner(tombstone.owner.as_deref(), client.identity()),
                    session_id: tombstone.id,
                    reason: tombstone.reason,
                })));
            }
        };

        // Link first so a close racing with the attach unlinks us.
        self.clients.link(client.id(), session.id()).await;
        let outcome = session.attach(client.clone()).await;

        match outcome.status {
            AttachStatus::Created | AttachStatus::Resumed => {
                // A stale eviction notice may have unlinked us meanwhile.
                if session.is_attached(client.id()).await {
                    self.clients.link(client.id(), session.id()).await;
                }
                Ok(None)
            }
            AttachStatus::Denied => {
                self.clients.unlink(client.id(), session.id()).await;
                Ok(Some(ServerMessage::TerminalDenied(TerminalDenied {
                    session_id: session.id().clone(),
                    reason: "session belongs to another user".to_string(),
                })))
            }
            AttachStatus::AlreadyClosed => {
                self.clients.unlink(client.id(), session.id()).await;
                let reason = session
                    .close_reason()
                    .await
                    .unwrap_or(CloseReason::ProcessExited);
                Ok(Some(ServerMessage::TerminalClosed(TerminalClosed {
                    session_id: session.id().clone(),
                    reason,
                    is_owner: outcome.is_owner,
                })))
            }
        }
    }

    async fn handle_input(&self, client: &ClientSink, req: TerminalInput) -> RouterResult {
        let session = self.attached_session(client, &req.session_id).await?;
        session.input(&req.data).await?;
        Ok(None)
    }

    async fn handle_resize(&self, client: &ClientSink, req: TerminalResize) -> RouterResult {
        debug!(
            session_id = %req.session_id,
            cols = req.cols,
            rows = req.rows,
            "Resizing session"
        );

        let session = self.attached_session(client, &req.session_id).await?;
        session.resize(req.cols, req.rows, client.id()).await?;
        Ok(None)
    }

    async fn handle_detach(&self, client: &ClientSink, req: TerminalDetach) -> RouterResult {
        info!(client_id = %client.id(), session_id = %req.session_id, "Detaching from session");

        self.clients.unlink(client.id(), &req.session_id).await;
        if let Some(session) = self.sessions.get(&req.session_id) {
            session.detach(client.id()).await;
        }
        Ok(None)
    }

    async fn handle_close(&self, client: &ClientSink, req: TerminalClose) -> RouterResult {
        info!(client_id = %client.id(), session_id = %req.session_id, "Closing session");

        let session = self.attached_session(client, &req.session_id).await?;
        session.close(CloseReason::ExplicitClose).await;
        Ok(None)
    }

    async fn handle_list(&self) -> RouterResult {
        let sessions = self
            .sessions
            .list_active()
            .await
            .into_iter()
            .map(|summary| SessionEntry {
                session_id: summary.id,
                status: summary.status.as_str().to_string(),
                clients: summary.clients,
                created_at: summary.created_at,
                cols: summary.size.cols,
                rows: summary.size.rows,
            })
            .collect();

        Ok(Some(ServerMessage::SessionList(SessionList { sessions })))
    }

    /// Resolves a session the client must already be attached to.
    async fn attached_session(
        &self,
        client: &ClientSink,
        session_id: &str,
    ) -> Result<Session, RouterError> {
        if !self.clients.is_linked(client.id(), session_id).await {
            return Err(RouterError::NotAttached(session_id.to_string()));
        }
        match self.sessions.get(session_id) {
            Some(session) => Ok(session),
            None if self.sessions.closed(session_id).is_some() => {
                Err(SessionError::Closed(session_id.to_string()).into())
            }
            None => Err(SessionError::NotFound(session_id.to_string()).into()),
        }
    }

    // =========================================================================
    // Session notices
    // =========================================================================

    /// Applies a lifecycle notice emitted by a session.
    pub async fn handle_notice(&self, notice: SessionNotice) {
        match notice {
            SessionNotice::ClientEvicted {
                session_id,
                client_id,
            } => {
                // The client may have attached again since it was evicted.
                // Unlink first and restore the link if so.
                self.clients.unlink(&client_id, &session_id).await;
                if let Some(session) = self.sessions.get(&session_id) {
                    if session.is_attached(&client_id).await {
                        self.clients.link(&client_id, &session_id).await;
                        debug!(
                            session_id = %session_id,
                            client_id = %client_id,
                            "Ignored eviction of reattached client"
                        );
                    }
                }
            }
            SessionNotice::Closed {
                session_id, reason, ..
            } => {
                let unlinked = self.clients.unlink_session(&session_id).await;
                if let Some(session) = self.sessions.get(&session_id) {
                    if session.status().await == SessionStatus::Closed {
                        self.sessions.retire(&session).await;
                    }
                }
                debug!(
                    session_id = %session_id,
                    reason = %reason,
                    unlinked = unlinked.len(),
                    "Processed session close"
                );
            }
        }
    }

    /// Consumes notices until the channel closes or `cancel` fires.
    pub async fn process_notices(
        self: Arc<Self>,
        mut notices: mpsc::UnboundedReceiver<SessionNotice>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                notice = notices.recv() => match notice {
                    Some(notice) => self.handle_notice(notice).await,
                    None => break,
                },
            }
        }

        // Apply whatever is already queued, e.g. closes from shutdown.
        while let Ok(notice) = notices.try_recv() {
            self.handle_notice(notice).await;
        }
        debug!("Session notice loop stopped");
    }
}

/// Session id a message refers to, for error context.
fn session_context(message: &ClientMessage) -> Option<String> {
    match message {
        ClientMessage::TerminalCreate(req) => req.session_id.clone(),
        ClientMessage::TerminalInput(req) => Some(req.session_id.clone()),
        ClientMessage::TerminalResize(req) => Some(req.session_id.clone()),
        ClientMessage::TerminalDetach(req) => Some(req.session_id.clone()),
        ClientMessage::TerminalClose(req) => Some(req.session_id.clone()),
        ClientMessage::ListSessions | ClientMessage::Ping(_) => None,
    }
}
