//! Network module for browser connections.
//!
//! Browsers reach the daemon over a WebSocket. Each connection gets a
//! reader task that dispatches decoded frames to the
//! [`MessageRouter`](crate::router::MessageRouter) and a writer task that
//! drains the connection's outbound channel.

pub mod websocket;

pub use websocket::{WebSocketServer, WebSocketSettings};
