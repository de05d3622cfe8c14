//! # webterm Protocol Library
//!
//! Message definitions and codecs shared by the webterm daemon and its
//! clients.
//!
//! ## Overview
//!
//! - **Message Definitions**: inbound [`ClientMessage`] and outbound
//!   [`ServerMessage`] events for terminal sessions
//! - **Codec**: JSON text frames or MessagePack binary frames, with byte
//!   payloads as base64 (JSON) or native binary (MessagePack)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Terminal Events                │  ClientMessage / ServerMessage
//! ├─────────────────────────────────────────┤
//! │              Codec                      │  JSON or MessagePack
//! ├─────────────────────────────────────────┤
//! │         Transport (WebSocket)           │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientMessage, Encoded, WireFormat};
//! use protocol::messages::TerminalInput;
//!
//! let message = ClientMessage::TerminalInput(TerminalInput {
//!     session_id: "S1".to_string(),
//!     data: b"ls\n".to_vec(),
//! });
//!
//! let Encoded::Text(json) = WireFormat::Json.encode(&message).unwrap() else {
//!     unreachable!()
//! };
//! let decoded: ClientMessage = protocol::codec::decode_text(&json).unwrap();
//! assert_eq!(decoded, message);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Protocol message definitions
//! - [`codec`]: Wire formats
//! - [`error`]: Error types

pub mod codec;
pub mod error;
pub mod messages;

pub use codec::{Encoded, WireFormat, MAX_MESSAGE_SIZE};
pub use error::{ProtocolError, Result};
pub use messages::{ClientMessage, CloseReason, ServerMessage, PROTOCOL_VERSION};
