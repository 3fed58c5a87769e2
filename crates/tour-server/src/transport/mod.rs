//! Transport layer: WebSocket listener and framing helpers.

pub mod websocket;
