//! tour-client: client side of the tour terminal protocol.
//!
//! The pieces mirror what the browser terminal does, for native front ends:
//!
//! * [`TerminalController`] decides which envelopes to send and keeps the
//!   persisted session id in line with what the server reports. It performs
//!   no I/O itself; it returns [`Command`]s.
//! * [`SessionStore`] persists the session id between runs.
//! * [`TerminalSurface`] is where output, notices and errors are shown.
//! * [`ReconnectingTransport`] owns the WebSocket, with bounded exponential
//!   reconnects and a heartbeat.
//! * [`run`] wires the three together with a [`ResizeDebouncer`].
//!
//! # Quick Start
//!
//! ```no_run
//! use tour_client::{run, ClientInput, MemorySessionStore, BufferSurface,
//!     ReconnectingTransport, TerminalController, TransportConfig};
//!
//! # async fn example() -> tour_core::TourResult<()> {
//! let (transport, events) = ReconnectingTransport::connect(TransportConfig::new("ws://localhost:3000/ws"));
//! let mut controller = TerminalController::new(MemorySessionStore::default(), BufferSurface::new(80, 24));
//! let (input_tx, input_rx) = tokio::sync::mpsc::channel(64);
//! input_tx.send(ClientInput::Keys("echo hello\r".into())).await.ok();
//! let reason = run(&mut controller, &transport, events, input_rx).await?;
//! println!("{reason:?}");
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod controller;
pub mod debounce;
pub mod store;
pub mod surface;
pub mod transport;

pub use client::{run, ClientInput, ExitReason};
pub use controller::{Command, ControllerState, SessionPhase, TerminalController};
pub use debounce::ResizeDebouncer;
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
pub use surface::{BufferSurface, TerminalSurface};
pub use transport::{ReconnectingTransport, TransportConfig, TransportEvent};

pub use tour_core::{TourError, TourResult};
