//! WebSocket transport.
//!
//! Accepts browser connections, captures the caller's identity from a
//! configurable header on the upgrade request and the wire format from the
//! `format` query parameter, then runs two tasks per connection:
//!
//! - a **reader** (the connection task itself) that decodes frames, hands
//!   them to the [`MessageRouter`] and queues direct replies;
//! - a **writer** that drains the connection's bounded outbound channel,
//!   encodes each [`ServerMessage`] and sends heartbeat pings.
//!
//! Sessions push output into the same outbound channel, so per-connection
//! ordering is whatever order messages were enqueued in.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use protocol::messages::Welcome;
use protocol::{codec, ClientMessage, Encoded, ProtocolError, ServerMessage, WireFormat, PROTOCOL_VERSION};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::router::{MessageRouter, RouterError};
use crate::session::ClientSink;

/// Shortest heartbeat interval accepted.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// Transport settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketSettings {
    /// Upgrade-request header carrying the caller's identity.
    pub identity_header: String,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Capacity of each connection's outbound channel.
    pub channel_capacity: usize,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            identity_header: "X-Forwarded-User".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            channel_capacity: 256,
        }
    }
}

/// WebSocket server feeding a [`MessageRouter`].
pub struct WebSocketServer {
    router: Arc<MessageRouter>,
    settings: WebSocketSettings,
    connections: AtomicUsize,
}

impl WebSocketServer {
    /// Creates a server.
    pub fn new(router: Arc<MessageRouter>, settings: WebSocketSettings) -> Self {
        Self {
            router,
            settings,
            connections: AtomicUsize::new(0),
        }
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Accepts connections until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Accept loop stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        let shutdown = shutdown.child_token();
                        tokio::spawn(async move {
                            server.connections.fetch_add(1, Ordering::SeqCst);
                            if let Err(e) = Arc::clone(&server)
                                .handle_connection(stream, peer, shutdown)
                                .await
                            {
                                tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
                            }
                            server.connections.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), ProtocolError> {
        let mut identity = None;
        let mut format = WireFormat::Json;
        let header = self.settings.identity_header.as_str();

        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            identity = request
                .headers()
                .get(header)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string);
            format = WireFormat::from_query(request.uri().query());
            Ok(response)
        };

        let ws = accept_hdr_async(stream, callback)
            .await
            .map_err(|e| ProtocolError::ConnectionClosed(format!("handshake failed: {e}")))?;

        let client_id = Uuid::new_v4().to_string();
        tracing::info!(
            peer = %peer,
            client_id = %client_id,
            identity = ?identity,
            format = ?format,
            "WebSocket connection accepted"
        );

        let (ws_sink, mut ws_stream) = ws.split();
        let (tx, rx) = mpsc::channel(self.settings.channel_capacity.max(1));
        let client = ClientSink::new(client_id.clone(), identity, tx);

        let writer_stop = CancellationToken::new();
        let writer = tokio::spawn(write_loop(
            ws_sink,
            rx,
            format,
            self.settings.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL),
            writer_stop.clone(),
            client_id.clone(),
        ));

        self.router.connect(&client).await;
        client
            .send(ServerMessage::Welcome(Welcome {
                client_id: client_id.clone(),
                protocol_version: PROTOCOL_VERSION,
            }))
            .await;

        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = ws_stream.next() => frame,
            };

            let decoded: Result<ClientMessage, ProtocolError> = match frame {
                Some(Ok(WsMessage::Text(text))) => codec::decode_text(&text),
                Some(Ok(WsMessage::Binary(bytes))) => codec::decode_binary(&bytes),
                Some(Ok(WsMessage::Close(_))) | None => break,
                // Pings are answered by tungstenite; pongs only prove liveness.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!(client_id = %client_id, error = %e, "WebSocket read failed");
                    break;
                }
            };

            let reply = match decoded {
                Ok(message) => self.router.handle(&client, message).await,
                Err(e) => {
                    tracing::warn!(client_id = %client_id, error = %e, "Undecodable frame");
                    Some(ServerMessage::Error(
                        RouterError::InvalidRequest(e.to_string()).to_error_message(None),
                    ))
                }
            };

            if let Some(reply) = reply {
                if !client.send(reply).await {
                    break;
                }
            }
        }

        self.router.disconnect(&client_id).await;
        drop(client);
        writer_stop.cancel();
        if let Err(e) = writer.await {
            tracing::warn!(client_id = %client_id, error = %e, "Writer task failed");
        }

        tracing::info!(client_id = %client_id, "WebSocket connection closed");
        Ok(())
    }
}

async fn write_loop(
    mut sink: WsSink,
    mut rx: mpsc::Receiver<ServerMessage>,
    format: WireFormat,
    heartbeat: Duration,
    stop: CancellationToken,
    client_id: String,
) {
    let mut heartbeat_interval = tokio::time::interval(heartbeat);
    // The first tick completes immediately.
    heartbeat_interval.tick().await;

    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(message) => {
                    if send_encoded(&mut sink, format, &message, &client_id).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = heartbeat_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new())).await {
                    tracing::debug!(client_id = %client_id, error = %e, "Failed to send heartbeat ping");
                    break;
                }
            }
            _ = stop.cancelled() => {
                // Flush what is already queued, e.g. close notices.
                while let Ok(message) = rx.try_recv() {
                    if send_encoded(&mut sink, format, &message, &client_id).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = sink.close().await;
}

async fn send_encoded(
    sink: &mut WsSink,
    format: WireFormat,
    message: &ServerMessage,
    client_id: &str,
) -> Result<(), ()> {
    let frame = match format.encode(message) {
        Ok(Encoded::Text(text)) => WsMessage::Text(text),
        Ok(Encoded::Binary(bytes)) => WsMessage::Binary(bytes),
        Err(e) => {
            // Drop the message, keep the connection.
            tracing::error!(client_id = %client_id, error = %e, "Failed to encode message");
            return Ok(());
        }
    };

    sink.send(frame).await.map_err(|e| {
        tracing::debug!(client_id = %client_id, error = %e, "Failed to send WebSocket message");
    })
}
