//! Protocol message definitions for webterm.
//!
//! This module defines the events exchanged between browser clients and the
//! daemon. Inbound events are [`ClientMessage`] variants, outbound events are
//! [`ServerMessage`] variants. Both are adjacently tagged so that a JSON frame
//! looks like `{"type": "terminal_input", "data": {...}}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Events sent by a client to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create a session, or attach to an existing one.
    TerminalCreate(TerminalCreate),
    /// Keyboard (or pasted) input for a session.
    TerminalInput(TerminalInput),
    /// Terminal dimensions changed on the client.
    TerminalResize(TerminalResize),
    /// Stop viewing a session without closing it.
    TerminalDetach(TerminalDetach),
    /// Close a session for everyone.
    TerminalClose(TerminalClose),
    /// Request a snapshot of the active sessions.
    ListSessions,
    /// Keepalive.
    Ping(Ping),
}

/// Events sent by the daemon to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every connection.
    Welcome(Welcome),
    /// Attach succeeded; carries the history snapshot.
    TerminalReady(TerminalReady),
    /// PTY output.
    TerminalOutput(TerminalOutput),
    /// The session is closed (or was already closed).
    TerminalClosed(TerminalClosed),
    /// Attach refused by the ownership policy.
    TerminalDenied(TerminalDenied),
    /// Another viewer resized the terminal.
    TerminalResized(TerminalResized),
    /// Snapshot of active sessions.
    SessionList(SessionList),
    /// Keepalive response.
    Pong(Pong),
    /// A request failed.
    Error(ErrorMessage),
}

// ============================================================================
// Client → daemon
// ============================================================================

/// Request to create or attach to a session.
///
/// Every field is optional on the wire; the daemon fills in its configured
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalCreate {
    /// Session to attach to. A new identifier is generated when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Requested terminal columns.
    #[serde(default)]
    pub cols: Option<u16>,
    /// Requested terminal rows.
    #[serde(default)]
    pub rows: Option<u16>,
    /// Shell command to run instead of the default shell.
    #[serde(default)]
    pub shell: Option<String>,
    /// Working directory for the shell.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Input bytes for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInput {
    /// Target session.
    pub session_id: String,
    /// Raw bytes, forwarded verbatim to the PTY.
    #[serde(with = "crate::codec::payload")]
    pub data: Vec<u8>,
}

/// Resize request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalResize {
    /// Target session.
    pub session_id: String,
    /// New terminal columns.
    pub cols: u16,
    /// New terminal rows.
    pub rows: u16,
}

/// Detach request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalDetach {
    /// Session to detach from.
    pub session_id: String,
}

/// Explicit close request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalClose {
    /// Session to close.
    pub session_id: String,
}

/// Ping for keepalive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Timestamp when ping was sent (for latency calculation).
    pub timestamp: u64,
}

// ============================================================================
// Daemon → client
// ============================================================================

/// Greeting sent once a connection is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    /// Identifier assigned to this connection.
    pub client_id: String,
    /// Protocol version spoken by the daemon.
    pub protocol_version: u8,
}

/// Successful attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalReady {
    /// Session that was attached.
    pub session_id: String,
    /// `false` when this attach created the session.
    pub resumed: bool,
    /// Retained output, oldest first, so the client can repaint.
    #[serde(with = "crate::codec::payload")]
    pub history: Vec<u8>,
    /// Current terminal columns.
    pub cols: u16,
    /// Current terminal rows.
    pub rows: u16,
}

/// PTY output chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalOutput {
    /// Session that produced the output.
    pub session_id: String,
    /// Raw bytes as produced by the PTY.
    #[serde(with = "crate::codec::payload")]
    pub data: Vec<u8>,
}

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The shell exited (or its PTY failed).
    ProcessExited,
    /// A client or the daemon closed the session.
    ExplicitClose,
    /// Nobody reattached before the idle timeout.
    IdleTimeout,
}

impl CloseReason {
    /// Wire name of the reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ProcessExited => "process_exited",
            CloseReason::ExplicitClose => "explicit_close",
            CloseReason::IdleTimeout => "idle_timeout",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session closed notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalClosed {
    /// Session that closed.
    pub session_id: String,
    /// Why it closed.
    pub reason: CloseReason,
    /// Whether the receiving client is the session's recorded owner.
    pub is_owner: bool,
}

/// Attach refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalDenied {
    /// Session the client tried to attach to.
    pub session_id: String,
    /// Human-readable explanation.
    pub reason: String,
}

/// Resize broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalResized {
    /// Session that was resized.
    pub session_id: String,
    /// New terminal columns.
    pub cols: u16,
    /// New terminal rows.
    pub rows: u16,
}

/// Summary of one active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    /// Session identifier.
    pub session_id: String,
    /// Lifecycle state name (`starting`, `active`, `idle`, ...).
    pub status: String,
    /// Number of attached clients.
    pub clients: usize,
    /// Creation time (Unix epoch milliseconds).
    pub created_at: u64,
    /// Current terminal columns.
    pub cols: u16,
    /// Current terminal rows.
    pub rows: u16,
}

/// Response to [`ClientMessage::ListSessions`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionList {
    /// Active sessions.
    pub sessions: Vec<SessionEntry>,
}

/// Pong response to ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Original timestamp from ping.
    pub timestamp: u64,
}

/// Error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Optional context (e.g., session_id).
    pub context: Option<String>,
    /// Whether the error is recoverable.
    pub recoverable: bool,
}

/// Error codes for common error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unknown or unspecified error.
    Unknown,
    /// The client is not attached to the session it addressed.
    NotAttached,
    /// Resource not found.
    NotFound,
    /// Invalid request or parameters.
    InvalidRequest,
    /// Server-side error.
    InternalError,
    /// Too many sessions.
    LimitReached,
    /// The client could not keep up with the output stream.
    SlowConsumer,
}

impl ServerMessage {
    /// Session this message refers to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerMessage::TerminalReady(m) => Some(&m.session_id),
            ServerMessage::TerminalOutput(m) => Some(&m.session_id),
            ServerMessage::TerminalClosed(m) => Some(&m.session_id),
            ServerMessage::TerminalDenied(m) => Some(&m.session_id),
            ServerMessage::TerminalResized(m) => Some(&m.session_id),
            ServerMessage::Welcome(_)
            | ServerMessage::SessionList(_)
            | ServerMessage::Pong(_)
            | ServerMessage::Error(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_json_shape() {
        let msg = ClientMessage::TerminalResize(TerminalResize {
            session_id: "s1".to_string(),
            cols: 120,
            rows: 40,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "terminal_resize", "data": {"session_id": "s1", "cols": 120, "rows": 40}})
        );
    }

    #[test]
    fn test_terminal_create_accepts_missing_fields() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "terminal_create", "data": {}}"#).unwrap();
        assert_eq!(msg, ClientMessage::TerminalCreate(TerminalCreate::default()));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type": "terminal_create", "data": {"session_id": "S1", "cols": 80, "rows": 24, "env": {"LANG": "C"}}}"#,
        )
        .unwrap();
        let ClientMessage::TerminalCreate(create) = msg else {
            panic!("expected terminal_create");
        };
        assert_eq!(create.session_id.as_deref(), Some("S1"));
        assert_eq!(create.cols, Some(80));
        assert_eq!(create.rows, Some(24));
        assert_eq!(create.shell, None);
        assert_eq!(create.env.get("LANG").map(String::as_str), Some("C"));
    }

    #[test]
    fn test_list_sessions_unit_variant() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type": "list_sessions"}"#).unwrap();
        assert_eq!(msg, ClientMessage::ListSessions);
    }

    #[test]
    fn test_input_data_is_base64_in_json() {
        let msg = ClientMessage::TerminalInput(TerminalInput {
            session_id: "s1".to_string(),
            data: b"ls\n".to_vec(),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["data"]["data"], json!("bHMK"));

        let decoded: ClientMessage = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let result: Result<ClientMessage, _> = serde_json::from_str(
            r#"{"type": "terminal_input", "data": {"session_id": "s1", "data": "***"}}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_close_reason_wire_names() {
        for (reason, name) in [
            (CloseReason::ProcessExited, "process_exited"),
            (CloseReason::ExplicitClose, "explicit_close"),
            (CloseReason::IdleTimeout, "idle_timeout"),
        ] {
            assert_eq!(serde_json::to_value(reason).unwrap(), json!(name));
            assert_eq!(reason.to_string(), name);
        }
    }

    #[test]
    fn test_terminal_closed_json_shape() {
        let msg = ServerMessage::TerminalClosed(TerminalClosed {
            session_id: "S3".to_string(),
            reason: CloseReason::IdleTimeout,
            is_owner: true,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "terminal_closed", "data": {"session_id": "S3", "reason": "idle_timeout", "is_owner": true}})
        );
    }

    #[test]
    fn test_server_message_session_id() {
        let output = ServerMessage::TerminalOutput(TerminalOutput {
            session_id: "abc".to_string(),
            data: vec![1, 2, 3],
        });
        assert_eq!(output.session_id(), Some("abc"));

        let pong = ServerMessage::Pong(Pong { timestamp: 7 });
        assert_eq!(pong.session_id(), None);
    }

    #[test]
    fn test_error_code_wire_names() {
        assert_eq!(
            serde_json::to_value(ErrorCode::SlowConsumer).unwrap(),
            json!("slow_consumer")
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::NotAttached).unwrap(),
            json!("not_attached")
        );
    }
}
