//! Async driver: runs a [`TerminalController`] against a live transport.
//!
//! The driver owns the two timers the controller asks for (the post-exit
//! recreate and the resize debounce) and turns controller [`Command`]s into
//! transport sends.

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use tour_core::TourResult;

use crate::controller::{Command, ControllerState, TerminalController};
use crate::debounce::ResizeDebouncer;
use crate::store::SessionStore;
use crate::surface::TerminalSurface;
use crate::transport::{ReconnectingTransport, TransportEvent, NORMAL_CLOSE};

/// What the front end feeds the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientInput {
    /// Raw keystrokes.
    Keys(String),
    /// The local terminal changed size. Debounced before sending.
    Resize { cols: u16, rows: u16 },
    /// Run a command line in the shell.
    Command(String),
    /// `cd` into a directory.
    Navigate(String),
    /// Destroy the session and stop.
    Terminate,
    /// Stop, leaving the session running on the server.
    Detach,
}

/// Why [`run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Detached,
    Terminated,
    /// The input channel closed.
    InputClosed,
    /// The server closed the connection cleanly.
    ServerClosed,
    /// Reconnect attempts ran out.
    GaveUp,
}

/// Drive `controller` until the user detaches or the connection is gone.
///
/// Fails with [`tour_core::TourError::Timeout`] if the transport does not
/// open in time.
pub async fn run<S, T>(
    controller: &mut TerminalController<S, T>,
    transport: &ReconnectingTransport,
    mut events: mpsc::Receiver<TransportEvent>,
    mut inputs: mpsc::Receiver<ClientInput>,
) -> TourResult<ExitReason>
where
    S: SessionStore,
    T: TerminalSurface,
{
    if let Err(e) = transport.wait_open().await {
        controller
            .surface_mut()
            .error(&format!("could not connect to {}", transport.url()));
        return Err(e);
    }

    let mut debouncer = ResizeDebouncer::default();
    let mut recreate_at: Option<Instant> = None;

    loop {
        let resize_at = debouncer.deadline().map(Instant::from_std);

        tokio::select! {
            event = events.recv() => match event {
                Some(TransportEvent::Connected) => {
                    let commands = if controller.state() == ControllerState::Uninitialized {
                        controller.init()
                    } else {
                        controller.on_reconnect()
                    };
                    debouncer.reset();
                    execute(commands, transport, &mut recreate_at);
                }
                Some(TransportEvent::Message(msg)) => {
                    let commands = controller.handle_message(msg);
                    execute(commands, transport, &mut recreate_at);
                }
                Some(TransportEvent::Disconnected { code }) => {
                    info!(?code, "disconnected");
                    if code == Some(NORMAL_CLOSE) {
                        return Ok(ExitReason::ServerClosed);
                    }
                }
                Some(TransportEvent::GaveUp) => {
                    controller.surface_mut().error("connection lost");
                    return Ok(ExitReason::GaveUp);
                }
                None => return Ok(ExitReason::ServerClosed),
            },

            input = inputs.recv() => match input {
                Some(ClientInput::Keys(keys)) => {
                    let commands = controller.input(&keys);
                    execute(commands, transport, &mut recreate_at);
                }
                Some(ClientInput::Resize { cols, rows }) => {
                    debouncer.push(cols, rows, std::time::Instant::now());
                }
                Some(ClientInput::Command(line)) => {
                    let commands = controller.send_command(&line);
                    execute(commands, transport, &mut recreate_at);
                }
                Some(ClientInput::Navigate(path)) => {
                    let commands = controller.navigate_to(&path);
                    execute(commands, transport, &mut recreate_at);
                }
                Some(ClientInput::Terminate) => {
                    let commands = controller.terminate();
                    execute(commands, transport, &mut recreate_at);
                    transport.close();
                    return Ok(ExitReason::Terminated);
                }
                Some(ClientInput::Detach) => {
                    debug!("detaching");
                    flush_resize(controller, &mut debouncer, transport, &mut recreate_at);
                    transport.close();
                    return Ok(ExitReason::Detached);
                }
                None => {
                    flush_resize(controller, &mut debouncer, transport, &mut recreate_at);
                    transport.close();
                    return Ok(ExitReason::InputClosed);
                }
            },

            _ = sleep_until_some(recreate_at) => {
                recreate_at = None;
                let commands = controller.recreate();
                execute(commands, transport, &mut recreate_at);
            },

            _ = sleep_until_some(resize_at) => {
                if let Some((cols, rows)) = debouncer.poll(std::time::Instant::now()) {
                    let commands = controller.resize(cols, rows);
                    execute(commands, transport, &mut recreate_at);
                }
            },
        }
    }
}

/// Send a pending resize now, so a session left running keeps the last size.
fn flush_resize<S, T>(
    controller: &mut TerminalController<S, T>,
    debouncer: &mut ResizeDebouncer,
    transport: &ReconnectingTransport,
    recreate_at: &mut Option<Instant>,
) where
    S: SessionStore,
    T: TerminalSurface,
{
    if let Some((cols, rows)) = debouncer.flush() {
        let commands = controller.resize(cols, rows);
        execute(commands, transport, recreate_at);
    }
}

fn execute(
    commands: Vec<Command>,
    transport: &ReconnectingTransport,
    recreate_at: &mut Option<Instant>,
) {
    for command in commands {
        match command {
            Command::Send(msg) => {
                if !transport.send(msg) {
                    warn!("envelope dropped, transport not open");
                }
            }
            Command::ScheduleRecreate(delay) => {
                *recreate_at = Some(Instant::now() + delay);
            }
        }
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
