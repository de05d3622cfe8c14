//! # webterm Daemon Library
//!
//! This crate provides the server side of webterm: shell sessions that
//! outlive the browser tabs viewing them.
//!
//! ## Overview
//!
//! - **PTY Sessions**: spawn shells on pseudo-terminals, keep a bounded
//!   output history and close idle sessions after a timeout
//! - **Multi-client**: any number of browser connections may attach to one
//!   session and see the same output in the same order
//! - **Ownership**: the identity that created a session is its owner; a
//!   strict policy refuses everyone else
//! - **WebSocket transport**: JSON or MessagePack frames
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                  WebSocket Server                         │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │                                  │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                   Message Router                          │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │           │                                   │                 │
//! │  ┌──────────────────┐               ┌──────────────────────┐    │
//! │  │ Session Registry │               │   Client Registry    │    │
//! │  └──────────────────┘               └──────────────────────┘    │
//! │           │                                                     │
//! │  ┌──────────────────┐  ┌──────────────┐  ┌─────────────────┐    │
//! │  │     Session      │──│   History    │  │    Ownership    │    │
//! │  └──────────────────┘  └──────────────┘  └─────────────────┘    │
//! │           │                                                     │
//! │  ┌──────────────────┐                                           │
//! │  │    PTY Handle    │                                           │
//! │  └──────────────────┘                                           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!     config.validate()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTYs, sessions, registries and ownership
//! - [`router`]: Message routing to the session layer
//! - [`network`]: WebSocket transport
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod network;
pub mod orchestrator;
pub mod router;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError};

pub use session::{
    ClientRegistry, OwnershipPolicy, Session, SessionError, SessionId, SessionRegistry,
    SessionSettings, SessionStatus,
};

pub use network::{WebSocketServer, WebSocketSettings};

pub use router::{MessageRouter, RouterError, RouterResult, SessionDefaults};

pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
