//! webterm daemon
//!
//! Serves shell sessions to browsers over WebSocket.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// webterm daemon - multi-client web terminal sessions.
#[derive(Parser, Debug)]
#[command(name = "webterm-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon and serve until interrupted
    Start {
        /// Address to listen on, overriding the configuration
        #[arg(long, short, value_name = "ADDR")]
        listen: Option<String>,
    },

    /// Load and validate the configuration, then print the effective values
    CheckConfig,

    /// Print the default configuration
    DefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::DefaultConfig = cli.command {
        print!("{}", Config::default().to_toml()?);
        return Ok(());
    }

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    match cli.command {
        Commands::Start { listen } => {
            if let Some(listen) = listen {
                config.server.listen_addr = listen;
            }
            config.validate()?;

            let _guard = init_tracing(&config, cli.verbose)?;
            tracing::info!("Using config file: {:?}", config_path);

            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run(&mut orchestrator).await?;
        }
        Commands::CheckConfig => {
            config.validate()?;
            println!("# {}", config_path.display());
            print!("{}", config.to_toml()?);
        }
        Commands::DefaultConfig => {}
    }

    Ok(())
}

/// Sets up the global subscriber. `RUST_LOG` wins over the configured level,
/// `--verbose` wins over both. Returns the file writer's guard, which must
/// live until exit so buffered lines are flushed.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.daemon.log_level.to_lowercase()))
    };

    match &config.daemon.log_file {
        Some(path) => {
            let (dir, file_name) = split_log_path(path)?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

fn split_log_path(path: &Path) -> anyhow::Result<(&Path, &std::ffi::OsStr)> {
    let file_name = path
        .file_name()
        .with_context(|| format!("log_file has no file name: {}", path.display()))?;
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok((dir, file_name))
}

/// Runs the orchestrator until a shutdown signal arrives.
async fn run(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    // Subscribe to orchestrator events for logging
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::Listening { addr } => {
                    tracing::debug!(addr = %addr, "Listener bound");
                }
                OrchestratorEvent::ClosedSessionsPruned { count } => {
                    tracing::debug!(count, "Closed sessions pruned");
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["webterm-daemon", "start"]).unwrap();
        match cli.command {
            Commands::Start { listen } => assert_eq!(listen, None),
            _ => panic!("Expected Start command"),
        }
        assert!(!cli.verbose);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_start_with_listen() {
        let cli =
            Cli::try_parse_from(["webterm-daemon", "start", "--listen", "0.0.0.0:9000"]).unwrap();
        match cli.command {
            Commands::Start { listen } => assert_eq!(listen.as_deref(), Some("0.0.0.0:9000")),
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "webterm-daemon",
            "check-config",
            "--config",
            "/etc/webterm.toml",
            "-v",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::CheckConfig));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/webterm.toml")));
        assert!(cli.verbose);
    }

    #[test]
    fn test_default_config_command() {
        let cli = Cli::try_parse_from(["webterm-daemon", "default-config"]).unwrap();
        assert!(matches!(cli.command, Commands::DefaultConfig));
    }

    #[test]
    fn test_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["webterm-daemon"]).is_err());
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        assert!(Cli::try_parse_from(["webterm-daemon", "pair"]).is_err());
    }

    #[test]
    fn test_split_log_path() {
        let (dir, name) = split_log_path(Path::new("/var/log/webterm.log")).unwrap();
        assert_eq!(dir, Path::new("/var/log"));
        assert_eq!(name, "webterm.log");

        let (dir, name) = split_log_path(Path::new("daemon.log")).unwrap();
        assert_eq!(dir, Path::new("."));
        assert_eq!(name, "daemon.log");

        assert!(split_log_path(Path::new("/")).is_err());
    }
}
