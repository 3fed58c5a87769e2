//! `tour-term attach`: interactive terminal bound to a server session.
//!
//! Enters raw mode, reads key and resize events on a dedicated thread, and
//! lets the client driver do the rest. `Ctrl+]` detaches, leaving the shell
//! running; the next `attach` picks it up again via the state file.

use std::path::Path;

use anyhow::{Context, Result};
use crossterm::event::{self, Event};
use tokio::sync::mpsc;
use tour_client::transport::check_url;
use tour_client::{
    run as drive, ClientInput, ExitReason, FileSessionStore, ReconnectingTransport,
    TerminalController, TransportConfig,
};
use tracing::{debug, info, warn};

use crate::terminal::{self as term, StdoutSurface};

pub async fn run(url: &str, state_file: &Path) -> Result<()> {
    check_url(url)?;
    info!(url, state_file = %state_file.display(), "attaching");

    let store = FileSessionStore::new(state_file);
    let mut controller = TerminalController::new(store, StdoutSurface::new());
    let (transport, events) = ReconnectingTransport::connect(TransportConfig::new(url));

    let guard = term::RawModeGuard::enter().context("failed to enter raw terminal mode")?;

    let (input_tx, input_rx) = mpsc::channel::<ClientInput>(64);
    // event::read blocks; a detached thread does not hold up exit.
    std::thread::Builder::new()
        .name("tour-term-input".into())
        .spawn(move || read_events(input_tx))
        .context("failed to start input thread")?;

    let outcome = drive(&mut controller, &transport, events, input_rx).await;
    drop(guard);

    let reason = outcome.with_context(|| format!("could not connect to {url}"))?;
    debug!(?reason, "client stopped");
    match reason {
        ExitReason::Detached | ExitReason::InputClosed => {
            eprintln!("\r\ntour-term: detached; the session keeps running.");
        }
        ExitReason::Terminated => eprintln!("\r\ntour-term: session destroyed."),
        ExitReason::ServerClosed => eprintln!("\r\ntour-term: server closed the connection."),
        ExitReason::GaveUp => anyhow::bail!("lost connection to {url}"),
    }
    Ok(())
}

fn read_events(tx: mpsc::Sender<ClientInput>) {
    loop {
        let input = match event::read() {
            Ok(Event::Key(key)) if term::is_detach_key(&key) => ClientInput::Detach,
            Ok(Event::Key(key)) => match term::key_to_input(&key) {
                Some(keys) => ClientInput::Keys(keys),
                None => continue,
            },
            Ok(Event::Paste(text)) => ClientInput::Keys(text),
            Ok(Event::Resize(cols, rows)) => ClientInput::Resize { cols, rows },
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "terminal event error");
                break;
            }
        };
        let detach = input == ClientInput::Detach;
        if tx.blocking_send(input).is_err() || detach {
            break;
        }
    }
}
