//! tour-core: shared protocol library for the tour terminal.
//!
//! Provides the JSON envelope types spoken over the single WebSocket
//! connection, the text codec, session id generation and the error type used
//! by both the server and the native client.

pub mod codec;
pub mod error;
pub mod ids;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode, encode, Utf8StreamDecoder};
pub use error::{TourError, TourResult};
pub use ids::{generate_session_id, new_terminal_id};
pub use messages::{
    now_millis, ClientMessage, NotificationLevel, ServerMessage, TerminalEvent, TerminalRequest,
    DEFAULT_COLS, DEFAULT_ROWS,
};
