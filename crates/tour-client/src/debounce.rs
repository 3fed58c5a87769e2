//! Trailing-edge debounce for resize events.
//!
//! While the user drags a window edge the terminal reports a new size every
//! frame. Only the size that holds still for [`DEFAULT_QUIET`] is sent, and a
//! size equal to the last one sent is skipped.

use std::time::{Duration, Instant};

/// About one frame.
pub const DEFAULT_QUIET: Duration = Duration::from_millis(16);

#[derive(Debug, Clone)]
pub struct ResizeDebouncer {
    quiet: Duration,
    pending: Option<(u16, u16)>,
    last_event: Option<Instant>,
    last_sent: Option<(u16, u16)>,
}

impl Default for ResizeDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_QUIET)
    }
}

impl ResizeDebouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending: None,
            last_event: None,
            last_sent: None,
        }
    }

    /// Record a size reported at `now`.
    pub fn push(&mut self, cols: u16, rows: u16, now: Instant) {
        self.pending = Some((cols, rows));
        self.last_event = Some(now);
    }

    /// When [`poll`](Self::poll) should next be called, if anything is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending?;
        self.last_event.map(|at| at + self.quiet)
    }

    /// The settled size, once the quiet period has passed.
    pub fn poll(&mut self, now: Instant) -> Option<(u16, u16)> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        self.take()
    }

    /// Emit whatever is pending right away.
    pub fn flush(&mut self) -> Option<(u16, u16)> {
        self.take()
    }

    /// Forget what was sent, so the next settled size goes out even if it
    /// matches. Used after the session changes.
    pub fn reset(&mut self) {
        self.last_sent = None;
    }

    fn take(&mut self) -> Option<(u16, u16)> {
        let size = self.pending.take()?;
        self.last_event = None;
        if self.last_sent == Some(size) {
            return None;
        }
        self.last_sent = Some(size);
        Some(size)
    }
}
