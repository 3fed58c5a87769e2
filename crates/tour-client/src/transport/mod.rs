//! Reconnecting WebSocket transport.
//!
//! One long-lived connection to the server's WebSocket path. When it drops,
//! the transport reconnects with exponential backoff (1 s, 2 s, 4 s, ...) for
//! a bounded number of attempts. A clean close (code 1000) is final.

pub mod websocket;

pub use websocket::ReconnectingTransport;

use std::time::Duration;
use tour_core::{ServerMessage, TourError, TourResult};

/// WebSocket close code for a normal, intentional close.
pub const NORMAL_CLOSE: u16 = 1000;

/// Connection and retry knobs.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// `ws://host:port/path`
    pub url: String,
    /// Reconnect attempts after a drop before giving up.
    pub max_attempts: u32,
    /// Delay before the first reconnect; doubles on each further attempt.
    pub base_delay: Duration,
    pub heartbeat_interval: Duration,
    /// `wait_open` polls this often...
    pub open_poll_interval: Duration,
    /// ...this many times.
    pub open_poll_attempts: u32,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            open_poll_interval: Duration::from_millis(100),
            open_poll_attempts: 50,
        }
    }
}

/// What the transport reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The socket is open (first connect or a reconnect).
    Connected,
    /// A decoded server envelope.
    Message(ServerMessage),
    /// The socket closed. `code` is the close code, if the server sent one.
    Disconnected { code: Option<u16> },
    /// Reconnect attempts are exhausted; no further events follow.
    GaveUp,
}

/// Delay before reconnect attempt `attempt` (1-based).
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1 << exponent)
}

/// Reject URLs the transport cannot dial.
pub fn check_url(url: &str) -> TourResult<()> {
    if url.to_ascii_lowercase().starts_with("ws://") {
        Ok(())
    } else {
        Err(TourError::Transport(format!(
            "unsupported URL: {url} (expected ws://host:port/path)"
        )))
    }
}
