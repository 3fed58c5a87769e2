//! Client-side terminal state machine.
//!
//! The controller owns the persisted session id and decides which envelopes
//! to send in response to server events and user actions. It performs no
//! I/O: every entry point returns the [`Command`]s the driver must carry out,
//! which keeps it deterministic under test.
//!
//! Lifecycle: `Uninitialized → Initialized`, with the session sub-state
//! `NoSession → AwaitingServer → Bound → Dead`. A dead session is replaced
//! automatically after [`DEFAULT_RECREATE_DELAY`].

use std::time::Duration;

use tour_core::{
    new_terminal_id, ClientMessage, ServerMessage, TerminalEvent, TerminalRequest,
};
use tracing::{debug, info, trace, warn};

use crate::store::SessionStore;
use crate::surface::TerminalSurface;

/// Pause between an `exit` and the replacement `create`.
pub const DEFAULT_RECREATE_DELAY: Duration = Duration::from_secs(1);

/// Shown when the shell exits.
pub const EXIT_NOTICE: &str = "Terminal session ended. Creating new session...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Uninitialized,
    Initialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No session id in use.
    NoSession,
    /// `check` or `create` sent, no answer yet.
    AwaitingServer,
    /// The server confirmed the session.
    Bound,
    /// The shell exited; a replacement is scheduled.
    Dead,
}

/// Work for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Send this envelope if the transport is open.
    Send(ClientMessage),
    /// Call [`TerminalController::recreate`] after this delay.
    ScheduleRecreate(Duration),
}

pub struct TerminalController<S, T> {
    store: S,
    surface: T,
    state: ControllerState,
    phase: SessionPhase,
    session_id: Option<String>,
    recreate_delay: Duration,
}

impl<S: SessionStore, T: TerminalSurface> TerminalController<S, T> {
    pub fn new(store: S, surface: T) -> Self {
        Self {
            store,
            surface,
            state: ControllerState::Uninitialized,
            phase: SessionPhase::NoSession,
            session_id: None,
            recreate_delay: DEFAULT_RECREATE_DELAY,
        }
    }

    pub fn with_recreate_delay(mut self, delay: Duration) -> Self {
        self.recreate_delay = delay;
        self
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn surface(&self) -> &T {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut T {
        &mut self.surface
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Start up once the transport is open: reattach to the persisted
    /// session, or create a new one.
    pub fn init(&mut self) -> Vec<Command> {
        if self.state == ControllerState::Initialized {
            return Vec::new();
        }
        self.state = ControllerState::Initialized;
        self.attach()
    }

    /// The transport came back after a drop.
    pub fn on_reconnect(&mut self) -> Vec<Command> {
        if self.state == ControllerState::Uninitialized {
            return self.init();
        }
        match (&self.session_id, self.phase) {
            (Some(id), _) => {
                info!(session_id = %id, "reconnected, checking session");
                self.phase = SessionPhase::AwaitingServer;
                vec![send(TerminalRequest::Check {
                    session_id: id.clone(),
                })]
            }
            // A replacement is already scheduled.
            (None, SessionPhase::Dead) => Vec::new(),
            (None, _) => self.attach(),
        }
    }

    /// Route one server envelope.
    pub fn handle_message(&mut self, msg: ServerMessage) -> Vec<Command> {
        match msg {
            ServerMessage::Terminal(event) => self.handle_event(event),
            ServerMessage::HeartbeatResponse {
                timestamp,
                server_time,
            } => {
                trace!(timestamp, server_time, "heartbeat response");
                Vec::new()
            }
            ServerMessage::SystemNotification { message, level } => {
                info!(?level, %message, "server notification");
                self.surface.notice(&message);
                Vec::new()
            }
            ServerMessage::FileChanged { exercise, file }
            | ServerMessage::FileUpdated { exercise, file } => {
                debug!(%exercise, %file, "file notification");
                Vec::new()
            }
            ServerMessage::Other => Vec::new(),
        }
    }

    /// Apply one terminal event. Events for other sessions are ignored.
    pub fn handle_event(&mut self, event: TerminalEvent) -> Vec<Command> {
        if self.state == ControllerState::Uninitialized {
            return Vec::new();
        }
        if self.session_id.as_deref() != Some(event.session_id()) {
            trace!(session_id = event.session_id(), "event for another session ignored");
            return Vec::new();
        }

        match event {
            TerminalEvent::Created { session_id } | TerminalEvent::Exists { session_id } => {
                debug!(%session_id, "session bound");
                self.phase = SessionPhase::Bound;
                Vec::new()
            }
            TerminalEvent::NotFound { session_id } => {
                info!(%session_id, "session gone, creating a new one");
                self.forget();
                vec![self.create_fresh()]
            }
            TerminalEvent::Output { data, .. } => {
                self.surface.write_output(&data);
                Vec::new()
            }
            TerminalEvent::Exit { session_id, code } => {
                info!(%session_id, ?code, "session exited");
                self.forget();
                self.phase = SessionPhase::Dead;
                self.surface.notice(EXIT_NOTICE);
                vec![Command::ScheduleRecreate(self.recreate_delay)]
            }
            TerminalEvent::Error {
                session_id,
                message,
            } => {
                warn!(%session_id, %message, "server reported an error");
                self.surface.error(&message);
                // A failed create leaves nothing to talk to.
                if self.phase == SessionPhase::AwaitingServer {
                    self.forget();
                }
                Vec::new()
            }
        }
    }

    /// Replace a dead session. Does nothing unless one is due.
    pub fn recreate(&mut self) -> Vec<Command> {
        if self.phase != SessionPhase::Dead {
            return Vec::new();
        }
        vec![self.create_fresh()]
    }

    /// Keystrokes, forwarded verbatim.
    pub fn input(&mut self, data: &str) -> Vec<Command> {
        match &self.session_id {
            Some(id) if !data.is_empty() => vec![send(TerminalRequest::Input {
                session_id: id.clone(),
                input: data.to_string(),
            })],
            _ => Vec::new(),
        }
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> Vec<Command> {
        match &self.session_id {
            Some(id) => vec![send(TerminalRequest::Resize {
                session_id: id.clone(),
                cols,
                rows,
            })],
            None => Vec::new(),
        }
    }

    /// Type a command line and press Enter.
    pub fn send_command(&mut self, command: &str) -> Vec<Command> {
        self.input(&format!("{command}\r"))
    }

    /// `cd` the shell into `path`.
    pub fn navigate_to(&mut self, path: &str) -> Vec<Command> {
        self.send_command(&format!("cd {}", shell_quote(path)))
    }

    /// Destroy the session on the server and forget it locally.
    pub fn terminate(&mut self) -> Vec<Command> {
        let Some(id) = self.session_id.clone() else {
            return Vec::new();
        };
        info!(session_id = %id, "terminating session");
        self.forget();
        vec![send(TerminalRequest::Destroy { session_id: id })]
    }

    fn attach(&mut self) -> Vec<Command> {
        match self.store.load() {
            Some(id) => {
                info!(session_id = %id, "checking persisted session");
                self.session_id = Some(id.clone());
                self.phase = SessionPhase::AwaitingServer;
                vec![send(TerminalRequest::Check { session_id: id })]
            }
            None => vec![self.create_fresh()],
        }
    }

    fn create_fresh(&mut self) -> Command {
        let id = new_terminal_id();
        if let Err(e) = self.store.save(&id) {
            warn!(error = %e, "failed to persist session id");
        }
        let (cols, rows) = self.surface.size();
        debug!(session_id = %id, cols, rows, "creating session");
        self.session_id = Some(id.clone());
        self.phase = SessionPhase::AwaitingServer;
        send(TerminalRequest::Create {
            session_id: Some(id),
            cols: Some(cols),
            rows: Some(rows),
        })
    }

    fn forget(&mut self) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "failed to clear session id");
        }
        self.session_id = None;
        self.phase = SessionPhase::NoSession;
    }
}

fn send(request: TerminalRequest) -> Command {
    Command::Send(ClientMessage::Terminal(request))
}

/// Single-quote for POSIX shells unless the path is plainly safe.
fn shell_quote(path: &str) -> String {
    let safe = !path.is_empty()
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-~".contains(c));
    if safe {
        path.to_string()
    } else {
        format!("'{}'", path.replace('\'', r"'\''"))
    }
}
