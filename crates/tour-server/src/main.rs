//! tour-server: terminal server for the tour learning platform.
//!
//! Accepts WebSocket connections on one path and multiplexes any number of
//! pty-backed shell sessions over each, keyed by client-chosen session ids
//! that survive reconnects.

mod config;
mod connections;
mod limits;
mod server;
mod session;
mod transport;
mod watcher;

use clap::Parser;
use config::{ConfigOverrides, DisconnectPolicy, ServerConfig};
use server::TourServer;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long shutdown waits for clients to receive the goodbye.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// tour-server: PTY sessions over WebSocket
#[derive(Parser, Debug)]
#[command(name = "tour-server", version, about = "Terminal server for the tour learning platform")]
struct Cli {
    /// Listen port
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Config file path
    #[arg(long, default_value = "~/.tour/server.toml")]
    config: String,

    /// Exercises directory (shell working directory and watch root)
    #[arg(long, env = "EXERCISES_PATH")]
    exercises_path: Option<PathBuf>,

    /// Shell to spawn instead of the platform default
    #[arg(long)]
    shell: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// What to do with sessions when their connection closes
    #[arg(long, value_enum)]
    on_disconnect: Option<DisconnectPolicy>,

    /// Log every WebSocket frame at debug level
    #[arg(long, env = "DEBUG_WEBSOCKET")]
    debug_websocket: bool,

    /// Do not watch the exercises directory for changes
    #[arg(long)]
    no_watch: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting tour-server");

    let overrides = ConfigOverrides {
        port: cli.port,
        bind: cli.bind,
        max_sessions: cli.max_sessions,
        shell: cli.shell,
        exercises_path: cli.exercises_path,
        on_disconnect: cli.on_disconnect,
        debug_websocket: cli.debug_websocket,
        no_watch: cli.no_watch,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = Arc::new(TourServer::new(server_config));
    let addr = match server.start().await {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };
    info!(url = %format!("ws://{addr}"), "listening");

    shutdown_signal().await;
    info!("received shutdown signal");
    server.shutdown().await;
    if tokio::time::timeout(SHUTDOWN_GRACE, server.wait_drained())
        .await
        .is_err()
    {
        warn!("connections still open after shutdown grace period");
    }

    info!("tour-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
