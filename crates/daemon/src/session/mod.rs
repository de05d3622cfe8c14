//! Session management module.
//!
//! This module provides the PTY wrapper, the per-session state machine, the
//! session registry and the client connection registry. Sessions outlive the
//! connections that view them: clients attach, detach and reattach while the
//! shell keeps running.

pub mod clients;
pub mod history;
pub mod lifecycle;
pub mod ownership;
pub mod pty;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

use thiserror::Error;

pub use clients::{ClientRecord, ClientRegistry};
pub use history::{HistoryBuffer, DEFAULT_HISTORY_LIMIT};
pub use lifecycle::{
    AttachOutcome, AttachStatus, ClientSink, ClientStats, Session, SessionNotice,
    SessionSettings, SessionStatus, SessionSummary,
};
pub use ownership::{AttachDecision, OwnershipPolicy};
pub use pty::{NativePtySpawner, PtyError, PtyEvent, PtyHandle, PtySpawner, SpawnOptions, TerminalSize};
pub use registry::{ClosedSession, Lookup, SessionParams, SessionRegistry};

/// Unique identifier for a session.
pub type SessionId = String;

/// Unique identifier for a client connection.
pub type ClientId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session is closing or closed.
    #[error("session closed: {0}")]
    Closed(SessionId),

    /// The requested session id is not acceptable.
    #[error("invalid session id: {0:?}")]
    InvalidId(String),

    /// The daemon already runs the maximum number of sessions.
    #[error("session limit reached ({0})")]
    LimitReached(usize),

    /// The PTY failed.
    #[error(transparent)]
    Pty(#[from] PtyError),
}
