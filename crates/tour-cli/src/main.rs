//! tour-term: native terminal for the tour server.
//!
//! Opens a raw-mode local terminal bound to a server-side shell session. The
//! session id is kept in a state file, so running `tour-term` again reattaches
//! to the same shell for as long as it is alive on the server.

mod commands;
mod config;
mod terminal;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

/// tour-term: terminal client for the tour server
#[derive(Parser)]
#[command(name = "tour-term", version, about = "Terminal client for the tour learning platform")]
struct Cli {
    /// Server WebSocket URL
    #[arg(short, long, global = true, env = "TOUR_URL")]
    url: Option<String>,

    /// File holding the persisted session id
    #[arg(long, global = true)]
    state_file: Option<PathBuf>,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Open the terminal, reattaching to the saved session if it is alive
    Attach,

    /// Destroy the saved session on the server and forget it
    Destroy,

    /// Show the saved session id
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr; stdout belongs to the remote shell.
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("tour_term=debug,tour_client=debug,tour_core=debug")
            .with_writer(std::io::stderr)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("tour_term=warn,tour_client=warn")
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config::default_path().to_string_lossy().into_owned());
    let cfg = match config::Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("tour-term: {e:#}");
            std::process::exit(1);
        }
    };

    // CLI flags override the config file.
    let url = cli.url.unwrap_or_else(|| cfg.default.url.clone());
    let state_file = cfg.state_file(cli.state_file);

    let result = match cli.command.unwrap_or(Command::Attach) {
        Command::Attach => commands::attach::run(&url, &state_file).await,
        Command::Destroy => commands::destroy::run(&url, &state_file).await,
        Command::Status => commands::status::run(&state_file),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("tour-term: {e:#}");
        std::process::exit(1);
    }
}
