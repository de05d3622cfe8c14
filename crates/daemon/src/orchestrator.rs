//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that builds the session and
//! client registries, the message router and the WebSocket server from a
//! [`Config`], and owns the background tasks that keep them running.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::CloseReason;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::network::WebSocketServer;
use crate::router::MessageRouter;
use crate::session::{
    ClientRegistry, NativePtySpawner, PtySpawner, SessionNotice, SessionRegistry,
};

/// Interval between sweeps of expired closed-session records.
const CLOSED_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// How long `stop` waits for background tasks.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, binding the listener.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// The WebSocket listener is bound.
    Listening { addr: SocketAddr },
    /// Expired closed-session records were dropped.
    ClosedSessionsPruned { count: usize },
    /// Error occurred.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Live and recently closed sessions.
    sessions: Arc<SessionRegistry>,
    /// Message router.
    router: Arc<MessageRouter>,
    /// WebSocket transport.
    server: Arc<WebSocketServer>,
    /// Session notices, consumed by the notice loop once started.
    notices: Option<mpsc::UnboundedReceiver<SessionNotice>>,
    /// Bound listener address.
    local_addr: Option<SocketAddr>,
    /// Background tasks.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator that spawns real PTYs.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_spawner(config, Arc::new(NativePtySpawner))
    }

    /// Creates a new daemon orchestrator with a custom PTY spawner.
    pub fn with_spawner(config: Config, spawner: Arc<dyn PtySpawner>) -> Result<Self> {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let sessions = Arc::new(SessionRegistry::new(
            spawner,
            config.session_settings(),
            config.session.max_sessions,
            config.closed_retention(),
            notice_tx,
        ));
        let clients = Arc::new(ClientRegistry::new());

        let router = Arc::new(MessageRouter::new(
            Arc::clone(&sessions),
            clients,
            config.session_defaults(),
        ));
        let server = Arc::new(WebSocketServer::new(
            Arc::clone(&router),
            config.websocket_settings(),
        ));

        let (event_tx, _) = broadcast::channel(256);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            sessions,
            router,
            server,
            notices: Some(notice_rx),
            local_addr: None,
            tasks: Mutex::new(Vec::new()),
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Starts the daemon orchestrator.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            if self.notices.is_none() {
                anyhow::bail!("Orchestrator cannot be restarted after stop");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                self.emit_event(OrchestratorEvent::Error {
                    message: format!("{e:#}"),
                });
                self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
                return Err(e);
            }
        };
        let local_addr = listener
            .local_addr()
            .context("Failed to read listener address")?;
        self.local_addr = Some(local_addr);

        let mut tasks = self.tasks.lock().await;

        // Session notices
        if let Some(notices) = self.notices.take() {
            tasks.push(tokio::spawn(
                Arc::clone(&self.router).process_notices(notices, self.shutdown_token.clone()),
            ));
        }

        // Closed-session cleanup
        tasks.push(tokio::spawn(Self::cleanup_loop(
            Arc::clone(&self.sessions),
            self.event_tx.clone(),
            self.shutdown_token.clone(),
        )));
        debug!("Started closed-session cleanup task");

        // Accept loop
        tasks.push(tokio::spawn(
            Arc::clone(&self.server).run(listener, self.shutdown_token.clone()),
        ));
        drop(tasks);

        info!(addr = %local_addr, "WebSocket server listening");
        self.emit_event(OrchestratorEvent::Listening { addr: local_addr });

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    async fn bind(&self) -> Result<TcpListener> {
        let listen_addr = self.config.listen_addr()?;
        TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("Failed to bind {listen_addr}"))
    }

    /// Periodically drops expired closed-session records.
    async fn cleanup_loop(
        sessions: Arc<SessionRegistry>,
        event_tx: broadcast::Sender<OrchestratorEvent>,
        shutdown_token: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(CLOSED_CLEANUP_INTERVAL);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => break,
                _ = interval.tick() => {
                    let count = sessions.prune_closed();
                    if count > 0 {
                        debug!(count, "Pruned closed sessions");
                        let _ = event_tx.send(OrchestratorEvent::ClosedSessionsPruned { count });
                    }
                }
            }
        }
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Every live session is closed with `explicit_close` so attached clients
    /// see `terminal_closed` before their connections are shut.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        self.sessions.close_all(CloseReason::ExplicitClose).await;

        // Signal shutdown to all tasks
        self.shutdown_token.cancel();

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            match tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Background task failed: {}", e),
                Err(_) => warn!("Background task did not stop in time"),
            }
        }

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the session registry.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Returns the message router.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Returns the number of open WebSocket connections.
    pub fn connection_count(&self) -> usize {
        self.server.connection_count()
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
