//! `tour-term destroy`: kill the saved session on the server.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tour_client::transport::check_url;
use tour_client::{FileSessionStore, ReconnectingTransport, SessionStore, TransportConfig};
use tour_core::{ClientMessage, TerminalRequest};
use tracing::info;

/// How long to wait for the destroy to be flushed.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn run(url: &str, state_file: &Path) -> Result<()> {
    check_url(url)?;
    let mut store = FileSessionStore::new(state_file);
    let Some(session_id) = store.load() else {
        println!("No saved session.");
        return Ok(());
    };

    let config = TransportConfig {
        max_attempts: 0,
        ..TransportConfig::new(url)
    };
    let (transport, mut events) = ReconnectingTransport::connect(config);
    transport
        .wait_open()
        .await
        .with_context(|| format!("could not connect to {url}"))?;

    info!(%session_id, "destroying session");
    transport.send(ClientMessage::Terminal(TerminalRequest::Destroy {
        session_id: session_id.clone(),
    }));
    transport.close();
    // The event stream ends once the close frame is out.
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
        while events.recv().await.is_some() {}
    })
    .await;

    store.clear()?;
    println!("Destroyed session {session_id}.");
    Ok(())
}
