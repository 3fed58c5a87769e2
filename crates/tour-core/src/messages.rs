//! Wire envelopes exchanged over the single WebSocket connection.
//!
//! Every envelope is a JSON object tagged by `type`. Terminal envelopes carry
//! a second tag, `action`, selecting the terminal sub-protocol operation.
//! Field names follow the browser's conventions (`sessionId`), so these types
//! are the single source of truth for both the server and the native client.

use serde::{Deserialize, Serialize};

/// Default terminal width when a `create` omits `cols`.
pub const DEFAULT_COLS: u16 = 80;
/// Default terminal height when a `create` omits `rows`.
pub const DEFAULT_ROWS: u16 = 24;

/// Client → server envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Terminal sub-protocol request.
    Terminal(TerminalRequest),
    /// Liveness check; answered with [`ServerMessage::HeartbeatResponse`].
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    /// Any other envelope type (activity tracking and similar). Accepted and
    /// ignored so that newer clients never get disconnected by older servers.
    #[serde(other)]
    Other,
}

/// Terminal actions sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TerminalRequest {
    /// Create a session, or rebind to it if it is still alive.
    Create {
        #[serde(
            rename = "sessionId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
    /// Ask whether a session is alive; rebinds it on success.
    Check {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Raw keystrokes for the shell.
    Input {
        #[serde(rename = "sessionId")]
        session_id: String,
        input: String,
    },
    /// New terminal dimensions.
    Resize {
        #[serde(rename = "sessionId")]
        session_id: String,
        cols: u16,
        rows: u16,
    },
    /// Kill the shell and forget the session.
    Destroy {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

impl TerminalRequest {
    /// The session this request addresses, if it names one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Create { session_id, .. } => session_id.as_deref(),
            Self::Check { session_id }
            | Self::Input { session_id, .. }
            | Self::Resize { session_id, .. }
            | Self::Destroy { session_id } => Some(session_id),
        }
    }

    /// Short action name, for logging.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Check { .. } => "check",
            Self::Input { .. } => "input",
            Self::Resize { .. } => "resize",
            Self::Destroy { .. } => "destroy",
        }
    }
}

/// Server → client envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Terminal sub-protocol event, always addressed to one connection.
    Terminal(TerminalEvent),
    HeartbeatResponse {
        timestamp: u64,
        server_time: u64,
    },
    /// A file under the exercises tree changed on disk.
    FileChanged {
        exercise: String,
        file: String,
    },
    /// A file was written through the REST API.
    FileUpdated {
        exercise: String,
        file: String,
    },
    SystemNotification {
        message: String,
        level: NotificationLevel,
    },
    #[serde(other)]
    Other,
}

/// Terminal actions sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TerminalEvent {
    Created {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Exists {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    NotFound {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Output {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: String,
    },
    Exit {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
    },
    Error {
        #[serde(rename = "sessionId")]
        session_id: String,
        message: String,
    },
}

impl TerminalEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Created { session_id }
            | Self::Exists { session_id }
            | Self::NotFound { session_id }
            | Self::Output { session_id, .. }
            | Self::Exit { session_id, .. }
            | Self::Error { session_id, .. } => session_id,
        }
    }
}

impl From<TerminalEvent> for ServerMessage {
    fn from(event: TerminalEvent) -> Self {
        ServerMessage::Terminal(event)
    }
}

impl From<TerminalRequest> for ClientMessage {
    fn from(request: TerminalRequest) -> Self {
        ClientMessage::Terminal(request)
    }
}

/// Severity of a [`ServerMessage::SystemNotification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Milliseconds since the Unix epoch (0 if the clock is before 1970).
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
