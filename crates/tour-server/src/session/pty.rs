//! Pseudo-terminal sessions.
//!
//! A [`PtyBackend`] spawns one shell attached to a fresh pty and hands back a
//! [`PtyProcess`] (input side) plus [`PtyEvents`] (output chunks and a
//! one-shot exit). [`PtySession`] wraps the process with the
//! `Running -> Exited` state machine the registry relies on.

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use tour_core::{TourError, TourResult};

/// Read buffer for the pty reader thread.
const READ_CHUNK: usize = 8192;

/// Output chunks buffered between the reader thread and the pump.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Everything needed to start one shell.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Explicit shell program; `None` resolves the platform default.
    pub shell: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub cwd: PathBuf,
    pub term: String,
    pub env: HashMap<String, String>,
}

impl SpawnSpec {
    /// The program to run: configured shell, else `$SHELL`, else the
    /// platform fallback.
    pub fn resolve_shell(&self) -> String {
        if let Some(shell) = self.shell.as_deref().filter(|s| !s.trim().is_empty()) {
            return shell.to_string();
        }
        default_shell()
    }
}

#[cfg(windows)]
fn default_shell() -> String {
    "powershell.exe".to_string()
}

#[cfg(not(windows))]
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Input side of a spawned shell. All calls may block briefly and belong on
/// a blocking thread.
pub trait PtyProcess: Send {
    fn write(&mut self, data: &[u8]) -> TourResult<()>;
    fn resize(&mut self, cols: u16, rows: u16) -> TourResult<()>;
    fn kill(&mut self) -> TourResult<()>;
}

/// Output side of a spawned shell.
pub struct PtyEvents {
    /// Raw output chunks in the order the pty produced them. Closes once the
    /// pty reaches end of file.
    pub output: mpsc::Receiver<Vec<u8>>,
    /// Fires once with the exit code, if the platform reports one.
    pub exit: oneshot::Receiver<Option<i32>>,
}

/// Spawns shells. The registry only sees this trait.
pub trait PtyBackend: Send + Sync {
    fn spawn(&self, spec: &SpawnSpec) -> TourResult<(Box<dyn PtyProcess>, PtyEvents)>;
}

// ---------------------------------------------------------------------------
// Native backend
// ---------------------------------------------------------------------------

/// Backend on the host's pty implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtyBackend;

struct NativePty {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

impl PtyProcess for NativePty {
    fn write(&mut self, data: &[u8]) -> TourResult<()> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> TourResult<()> {
        self.master
            .resize(pty_size(cols, rows))
            .map_err(|e| TourError::Other(format!("pty resize failed: {e}")))
    }

    fn kill(&mut self) -> TourResult<()> {
        self.killer.kill()?;
        Ok(())
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows: rows.max(1),
        cols: cols.max(1),
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn spawn_err(context: &str, e: impl std::fmt::Display) -> TourError {
    TourError::Spawn(format!("{context}: {e}"))
}

impl PtyBackend for NativePtyBackend {
    fn spawn(&self, spec: &SpawnSpec) -> TourResult<(Box<dyn PtyProcess>, PtyEvents)> {
        let pair = native_pty_system()
            .openpty(pty_size(spec.cols, spec.rows))
            .map_err(|e| spawn_err("failed to open pty", e))?;

        let shell = spec.resolve_shell();
        let mut cmd = CommandBuilder::new(&shell);
        cmd.cwd(&spec.cwd);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.env("TERM", &spec.term);

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| spawn_err(&format!("failed to start {shell}"), e))?;
        // The child holds its own copy; ours would keep the pty open past exit.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| spawn_err("failed to clone pty reader", e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| spawn_err("failed to take pty writer", e))?;
        let killer = child.clone_killer();

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        std::thread::Builder::new()
            .name("pty-reader".into())
            .spawn(move || read_loop(reader, output_tx))
            .map_err(|e| spawn_err("failed to start reader thread", e))?;

        let (exit_tx, exit_rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("pty-waiter".into())
            .spawn(move || {
                let code = match child.wait() {
                    Ok(status) => i32::try_from(status.exit_code()).ok(),
                    Err(e) => {
                        warn!(error = %e, "waiting for shell failed");
                        None
                    }
                };
                let _ = exit_tx.send(code);
            })
            .map_err(|e| spawn_err("failed to start waiter thread", e))?;

        info!(shell = %shell, cols = spec.cols, rows = spec.rows, cwd = %spec.cwd.display(), "pty spawned");

        let process = NativePty {
            master: pair.master,
            writer,
            killer,
        };
        Ok((
            Box::new(process),
            PtyEvents {
                output: output_rx,
                exit: exit_rx,
            },
        ))
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // EIO once the last slave handle closes on Linux.
                debug!(error = %e, "pty reader finished");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Session wrapper
// ---------------------------------------------------------------------------

/// Lifecycle of a [`PtySession`]. Spawning happens inside
/// [`PtySession::spawn`], which only ever returns a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyState {
    Running,
    Exited,
}

/// One shell process plus its pty, identified by the client's session id.
pub struct PtySession {
    id: String,
    generation: u64,
    process: Mutex<Box<dyn PtyProcess>>,
    /// cols in the high half, rows in the low half.
    size: AtomicU32,
    exited: AtomicBool,
    exited_at: Mutex<Option<Instant>>,
    killed: AtomicBool,
    created_at: Instant,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .finish()
    }
}

fn pack_size(cols: u16, rows: u16) -> u32 {
    (u32::from(cols) << 16) | u32::from(rows)
}

impl PtySession {
    /// Spawn a shell for `id` through `backend`.
    pub fn spawn(
        backend: &dyn PtyBackend,
        id: &str,
        generation: u64,
        spec: &SpawnSpec,
    ) -> TourResult<(Arc<Self>, PtyEvents)> {
        let (process, events) = backend.spawn(spec)?;
        let session = Arc::new(Self {
            id: id.to_string(),
            generation,
            process: Mutex::new(process),
            size: AtomicU32::new(pack_size(spec.cols, spec.rows)),
            exited: AtomicBool::new(false),
            exited_at: Mutex::new(None),
            killed: AtomicBool::new(false),
            created_at: Instant::now(),
        });
        Ok((session, events))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> PtyState {
        if self.exited.load(Ordering::Acquire) {
            PtyState::Exited
        } else {
            PtyState::Running
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == PtyState::Running
    }

    /// Current `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        let packed = self.size.load(Ordering::Relaxed);
        ((packed >> 16) as u16, (packed & 0xffff) as u16)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the process was observed to exit.
    pub fn exited_at(&self) -> Option<Instant> {
        self.exited_at.lock().ok().and_then(|t| *t)
    }

    /// Record that the process has exited. Returns `false` if it was
    /// already marked.
    pub fn mark_exited(&self) -> bool {
        if self.exited.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Ok(mut at) = self.exited_at.lock() {
            *at = Some(Instant::now());
        }
        true
    }

    fn process(&self) -> TourResult<std::sync::MutexGuard<'_, Box<dyn PtyProcess>>> {
        self.process
            .lock()
            .map_err(|_| TourError::Other("pty process lock poisoned".into()))
    }

    /// Raw bytes to the shell. Dropped once exited. Blocking.
    pub fn write(&self, data: &[u8]) -> TourResult<()> {
        if !self.is_running() {
            debug!(session_id = %self.id, "input for exited session dropped");
            return Ok(());
        }
        self.process()?.write(data)
    }

    /// Inform the pty of new dimensions. Dropped once exited. Blocking.
    pub fn resize(&self, cols: u16, rows: u16) -> TourResult<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.process()?.resize(cols, rows)?;
        self.size.store(pack_size(cols, rows), Ordering::Relaxed);
        debug!(session_id = %self.id, cols, rows, "pty resized");
        Ok(())
    }

    /// Terminate the shell. Idempotent; a process that is already gone is
    /// not an error.
    pub fn kill(&self) -> TourResult<()> {
        if !self.is_running() || self.killed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.process()?.kill() {
            Ok(()) => Ok(()),
            Err(TourError::Io(e)) => {
                debug!(session_id = %self.id, error = %e, "kill on finished process");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mock::MockBackend;
    use std::time::Duration;

    fn spec(cols: u16, rows: u16) -> SpawnSpec {
        SpawnSpec {
            shell: Some("/bin/sh".into()),
            cols,
            rows,
            cwd: std::env::temp_dir(),
            term: "xterm-256color".into(),
            env: HashMap::new(),
        }
    }

    #[test]
    fn explicit_shell_wins() {
        assert_eq!(spec(80, 24).resolve_shell(), "/bin/sh");
        let blank = SpawnSpec {
            shell: Some("  ".into()),
            ..spec(80, 24)
        };
        assert!(!blank.resolve_shell().trim().is_empty());
    }

    #[test]
    fn size_packing() {
        let backend = MockBackend::new();
        let (session, _events) = PtySession::spawn(&backend, "t1", 1, &spec(132, 43)).unwrap();
        assert_eq!(session.size(), (132, 43));
        session.resize(80, 24).unwrap();
        assert_eq!(session.size(), (80, 24));
        assert_eq!(backend.process(0).size(), (80, 24));
    }

    #[test]
    fn writes_after_exit_are_dropped() {
        let backend = MockBackend::new();
        let (session, _events) = PtySession::spawn(&backend, "t1", 1, &spec(80, 24)).unwrap();
        session.write(b"ls\n").unwrap();
        assert!(session.mark_exited());
        assert!(!session.mark_exited());
        assert!(session.exited_at().is_some());
        session.write(b"pwd\n").unwrap();
        session.resize(10, 10).unwrap();
        assert_eq!(backend.process(0).written(), b"ls\n");
        assert_eq!(session.size(), (80, 24));
        assert_eq!(session.state(), PtyState::Exited);
    }

    #[test]
    fn kill_is_idempotent() {
        let backend = MockBackend::new();
        let (session, _events) = PtySession::spawn(&backend, "t1", 1, &spec(80, 24)).unwrap();
        session.kill().unwrap();
        session.kill().unwrap();
        assert_eq!(backend.process(0).kills(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn native_shell_echoes_and_exits() {
        let (session, mut events) =
            PtySession::spawn(&NativePtyBackend, "native", 1, &spec(80, 24)).unwrap();

        let writer = session.clone();
        tokio::task::spawn_blocking(move || writer.write(b"echo tour-$((40+2))\nexit 3\n"))
            .await
            .unwrap()
            .unwrap();

        let mut seen = Vec::new();
        let collect = async {
            while let Some(chunk) = events.output.recv().await {
                seen.extend_from_slice(&chunk);
                if String::from_utf8_lossy(&seen).contains("tour-42") {
                    break;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), collect)
            .await
            .expect("shell output");
        assert!(String::from_utf8_lossy(&seen).contains("tour-42"));

        // Keep draining so the reader thread never blocks on a full channel.
        let drain = tokio::spawn(async move { while events.output.recv().await.is_some() {} });
        let code = tokio::time::timeout(Duration::from_secs(10), events.exit)
            .await
            .expect("shell exit")
            .unwrap();
        assert_eq!(code, Some(3));
        drain.abort();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn native_kill_fires_exit() {
        let (session, mut events) =
            PtySession::spawn(&NativePtyBackend, "native-kill", 1, &spec(80, 24)).unwrap();
        let drain = tokio::spawn(async move { while events.output.recv().await.is_some() {} });
        session.kill().unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(10), events.exit).await;
        assert!(exit.is_ok(), "exit event after kill");
        drain.abort();
    }

    #[test]
    fn missing_shell_is_spawn_error() {
        let bad = SpawnSpec {
            shell: Some("/definitely/not/a/shell".into()),
            ..spec(80, 24)
        };
        match PtySession::spawn(&NativePtyBackend, "bad", 1, &bad) {
            Err(TourError::Spawn(_)) => {}
            Err(other) => panic!("expected spawn error, got {other:?}"),
            Ok(_) => panic!("spawning a missing shell succeeded"),
        }
    }
}
