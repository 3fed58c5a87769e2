//! Session registry.
//!
//! Maps client-chosen session ids to live pty sessions and remembers which
//! connection each session currently reports to. Every map mutation runs
//! under the write lock. Spawning a process does not: `create` spawns with
//! the lock released and re-checks the id before inserting, so a slow spawn
//! never stalls other sessions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tour_core::{TerminalEvent, TourError, TourResult, Utf8StreamDecoder};
use tracing::{debug, info, warn};

use super::pty::{PtyBackend, PtyEvents, PtySession, SpawnSpec};
use crate::config::DisconnectPolicy;
use crate::connections::{ConnectionId, ConnectionRegistry};

/// How long the pump waits for more output after the exit event.
const EXIT_DRAIN: Duration = Duration::from_millis(100);

/// Upper bound on the whole post-exit drain. A background job that keeps
/// writing to the pty cannot hold back the `exit` envelope past this.
const EXIT_DRAIN_MAX: Duration = Duration::from_secs(1);

/// Exited entries younger than this are left for their pump to finish.
const EXITED_GRACE: Duration = Duration::from_secs(5);

/// Spawn parameters shared by every session.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub max_sessions: usize,
    pub shell: Option<String>,
    pub term: String,
    pub workdir: PathBuf,
    pub env: HashMap<String, String>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_sessions: 32,
            shell: None,
            term: "xterm-256color".into(),
            workdir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env: HashMap::new(),
        }
    }
}

/// Result of [`SessionRegistry::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExisted,
}

/// Result of [`SessionRegistry::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Exists,
    NotFound,
}

/// Snapshot of one entry, for logging and tests.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub generation: u64,
    pub cols: u16,
    pub rows: u16,
    pub bound: Option<ConnectionId>,
    pub running: bool,
    pub age_secs: u64,
}

struct SessionEntry {
    session: Arc<PtySession>,
    bound: Option<ConnectionId>,
}

/// Shared handle to all pty sessions. Cheap to clone.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
    backend: Arc<dyn PtyBackend>,
    connections: Arc<ConnectionRegistry>,
    settings: Arc<RegistrySettings>,
    next_generation: Arc<AtomicU64>,
}

impl SessionRegistry {
    pub fn new(
        backend: Arc<dyn PtyBackend>,
        connections: Arc<ConnectionRegistry>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            backend,
            connections,
            settings: Arc::new(settings),
            next_generation: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Create the session `id` for `conn`, or rebind it if it is still
    /// running. Replies to `conn` with `created` either way.
    ///
    /// The process is spawned with the lock released. If a concurrent
    /// `create` for the same id wins meanwhile, the new process is killed
    /// and `conn` is rebound to the winner.
    pub async fn create(
        &self,
        id: &str,
        cols: u16,
        rows: u16,
        conn: ConnectionId,
    ) -> TourResult<CreateOutcome> {
        {
            let mut sessions = self.sessions.write().await;
            if self.rebind_live(&mut sessions, id, conn) {
                drop(sessions);
                info!(session_id = %id, conn_id = conn, "create on live session, rebound");
                self.reply(conn, TerminalEvent::Created { session_id: id.into() })
                    .await;
                return Ok(CreateOutcome::AlreadyExisted);
            }
            if sessions.remove(id).is_some() {
                debug!(session_id = %id, "replacing exited session");
            }
            self.check_capacity(&sessions)?;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let spec = SpawnSpec {
            shell: self.settings.shell.clone(),
            cols,
            rows,
            cwd: self.settings.workdir.clone(),
            term: self.settings.term.clone(),
            env: self.settings.env.clone(),
        };
        let backend = self.backend.clone();
        let owned_id = id.to_string();
        let (session, events) = tokio::task::spawn_blocking(move || {
            PtySession::spawn(backend.as_ref(), &owned_id, generation, &spec)
        })
        .await
        .map_err(|e| TourError::Spawn(format!("spawn task failed: {e}")))??;

        let mut sessions = self.sessions.write().await;
        if self.rebind_live(&mut sessions, id, conn) {
            drop(sessions);
            debug!(session_id = %id, generation, "lost create race, discarding new process");
            if let Err(e) = session.kill() {
                warn!(session_id = %id, error = %e, "kill failed");
            }
            self.reply(conn, TerminalEvent::Created { session_id: id.into() })
                .await;
            return Ok(CreateOutcome::AlreadyExisted);
        }
        sessions.remove(id);
        if let Err(e) = self.check_capacity(&sessions) {
            drop(sessions);
            if let Err(kill_err) = session.kill() {
                warn!(session_id = %id, error = %kill_err, "kill failed");
            }
            return Err(e);
        }
        sessions.insert(
            id.to_string(),
            SessionEntry {
                session: session.clone(),
                bound: Some(conn),
            },
        );
        let total = sessions.len();
        drop(sessions);

        info!(session_id = %id, conn_id = conn, generation, cols, rows, total, "session created");
        // Queue the reply before the pump can queue any output.
        self.reply(conn, TerminalEvent::Created { session_id: id.into() })
            .await;
        tokio::spawn(self.clone().pump(session, events));
        Ok(CreateOutcome::Created)
    }

    /// Point a running entry at `conn`. False when `id` is absent or exited.
    fn rebind_live(
        &self,
        sessions: &mut HashMap<String, SessionEntry>,
        id: &str,
        conn: ConnectionId,
    ) -> bool {
        match sessions.get_mut(id) {
            Some(entry) if entry.session.is_running() => {
                entry.bound = Some(conn);
                true
            }
            _ => false,
        }
    }

    fn check_capacity(&self, sessions: &HashMap<String, SessionEntry>) -> TourResult<()> {
        if sessions.len() >= self.settings.max_sessions {
            return Err(TourError::Spawn(format!(
                "max sessions ({}) reached",
                self.settings.max_sessions
            )));
        }
        Ok(())
    }

    /// Report whether `id` is alive to `conn`, rebinding it on success.
    pub async fn check(&self, id: &str, conn: ConnectionId) -> CheckOutcome {
        let outcome = {
            let mut sessions = self.sessions.write().await;
            let running = sessions.get(id).map(|entry| entry.session.is_running());
            match running {
                Some(true) => {
                    if let Some(entry) = sessions.get_mut(id) {
                        entry.bound = Some(conn);
                    }
                    CheckOutcome::Exists
                }
                Some(false) => {
                    sessions.remove(id);
                    CheckOutcome::NotFound
                }
                None => CheckOutcome::NotFound,
            }
        };

        let session_id = id.to_string();
        match outcome {
            CheckOutcome::Exists => {
                info!(session_id = %id, conn_id = conn, "session rebound");
                self.reply(conn, TerminalEvent::Exists { session_id }).await;
            }
            CheckOutcome::NotFound => {
                debug!(session_id = %id, conn_id = conn, "check for unknown session");
                self.reply(conn, TerminalEvent::NotFound { session_id }).await;
            }
        }
        outcome
    }

    /// Forward keystrokes. Unknown ids are ignored.
    pub async fn input(&self, id: &str, data: Vec<u8>) -> TourResult<()> {
        let Some(session) = self.lookup(id).await else {
            debug!(session_id = %id, "input for unknown session ignored");
            return Ok(());
        };
        tokio::task::spawn_blocking(move || session.write(&data))
            .await
            .map_err(|e| TourError::Other(format!("pty write task failed: {e}")))?
    }

    /// Apply new dimensions. Unknown ids are ignored.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> TourResult<()> {
        let Some(session) = self.lookup(id).await else {
            debug!(session_id = %id, "resize for unknown session ignored");
            return Ok(());
        };
        tokio::task::spawn_blocking(move || session.resize(cols, rows))
            .await
            .map_err(|e| TourError::Other(format!("pty resize task failed: {e}")))?
    }

    /// Kill and forget `id`. No `exit` envelope follows. Returns whether a
    /// session was removed.
    pub async fn destroy(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(entry) => {
                if let Err(e) = entry.session.kill() {
                    warn!(session_id = %id, error = %e, "kill failed");
                }
                info!(session_id = %id, "session destroyed");
                true
            }
            None => {
                debug!(session_id = %id, "destroy for unknown session ignored");
                false
            }
        }
    }

    /// Apply the disconnect policy to every session bound to `conn`.
    /// Returns the affected session ids.
    pub async fn detach_connection(
        &self,
        conn: ConnectionId,
        policy: DisconnectPolicy,
    ) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let affected: Vec<String> = sessions
            .iter()
            .filter(|(_, entry)| entry.bound == Some(conn))
            .map(|(id, _)| id.clone())
            .collect();

        match policy {
            DisconnectPolicy::Detach => {
                for id in &affected {
                    if let Some(entry) = sessions.get_mut(id) {
                        entry.bound = None;
                    }
                }
                drop(sessions);
                for id in &affected {
                    debug!(session_id = %id, conn_id = conn, "session detached");
                }
            }
            DisconnectPolicy::Kill => {
                let removed: Vec<SessionEntry> =
                    affected.iter().filter_map(|id| sessions.remove(id)).collect();
                drop(sessions);
                for entry in removed {
                    if let Err(e) = entry.session.kill() {
                        warn!(session_id = %entry.session.id(), error = %e, "kill failed");
                    }
                    info!(session_id = %entry.session.id(), conn_id = conn, "session killed on disconnect");
                }
            }
        }
        affected
    }

    /// Remove entries whose process exited and whose pump never cleaned up.
    pub async fn gc(&self) -> Vec<String> {
        self.gc_older_than(EXITED_GRACE).await
    }

    async fn gc_older_than(&self, grace: Duration) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let mut removed = Vec::new();
        sessions.retain(|id, entry| {
            let stale = entry
                .session
                .exited_at()
                .is_some_and(|at| at.elapsed() >= grace);
            if stale {
                removed.push(id.clone());
            }
            !stale
        });
        if !removed.is_empty() {
            debug!(count = removed.len(), "gc removed exited sessions");
        }
        removed
    }

    /// Kill every session. Used at shutdown.
    pub async fn destroy_all(&self) -> usize {
        let drained: Vec<SessionEntry> = self.sessions.write().await.drain().map(|(_, e)| e).collect();
        for entry in &drained {
            if let Err(e) = entry.session.kill() {
                warn!(session_id = %entry.session.id(), error = %e, "kill failed");
            }
        }
        drained.len()
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .map(|(id, entry)| {
                let (cols, rows) = entry.session.size();
                SessionInfo {
                    id: id.clone(),
                    generation: entry.session.generation(),
                    cols,
                    rows,
                    bound: entry.bound,
                    running: entry.session.is_running(),
                    age_secs: entry.session.created_at().elapsed().as_secs(),
                }
            })
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn lookup(&self, id: &str) -> Option<Arc<PtySession>> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|entry| entry.session.clone())
    }

    /// The connection bound to `id`, if the entry still belongs to
    /// `generation`.
    async fn bound_connection(&self, id: &str, generation: u64) -> Option<ConnectionId> {
        let sessions = self.sessions.read().await;
        sessions
            .get(id)
            .filter(|entry| entry.session.generation() == generation)
            .and_then(|entry| entry.bound)
    }

    async fn reply(&self, conn: ConnectionId, event: TerminalEvent) {
        self.connections.send(conn, event).await;
    }

    async fn forward_output(&self, id: &str, generation: u64, data: String) {
        if data.is_empty() {
            return;
        }
        match self.bound_connection(id, generation).await {
            Some(conn) => {
                let event = TerminalEvent::Output {
                    session_id: id.to_string(),
                    data,
                };
                self.connections.try_send(conn, event).await;
            }
            None => debug!(session_id = %id, bytes = data.len(), "output for unbound session dropped"),
        }
    }

    /// Per-session task: relay output in order, then report the exit.
    async fn pump(self, session: Arc<PtySession>, mut events: PtyEvents) {
        let id = session.id().to_string();
        let generation = session.generation();
        let mut decoder = Utf8StreamDecoder::new();

        let code = loop {
            tokio::select! {
                biased;
                chunk = events.output.recv() => match chunk {
                    Some(bytes) => {
                        let text = decoder.feed(&bytes);
                        self.forward_output(&id, generation, text).await;
                    }
                    None => break (&mut events.exit).await.ok().flatten(),
                },
                code = &mut events.exit => {
                    // Output still in flight when the process is reaped.
                    let deadline = Instant::now() + EXIT_DRAIN_MAX;
                    while Instant::now() < deadline {
                        let wait = EXIT_DRAIN.min(deadline.saturating_duration_since(Instant::now()));
                        match tokio::time::timeout(wait, events.output.recv()).await {
                            Ok(Some(bytes)) => {
                                let text = decoder.feed(&bytes);
                                self.forward_output(&id, generation, text).await;
                            }
                            _ => break,
                        }
                    }
                    break code.ok().flatten();
                }
            }
        };

        let tail = decoder.finish();
        self.forward_output(&id, generation, tail).await;
        session.mark_exited();
        self.finish(&id, generation, code).await;
    }

    /// Remove the entry for a finished process and tell its connection,
    /// exactly once. A newer generation under the same id is left alone.
    async fn finish(&self, id: &str, generation: u64, code: Option<i32>) {
        let bound = {
            let mut sessions = self.sessions.write().await;
            let current = sessions.get(id).map(|entry| entry.session.generation());
            if current != Some(generation) {
                debug!(session_id = %id, generation, "exit for removed session dropped");
                return;
            }
            sessions.remove(id).and_then(|entry| entry.bound)
        };

        info!(session_id = %id, ?code, "session exited");
        if let Some(conn) = bound {
            self.reply(
                conn,
                TerminalEvent::Exit {
                    session_id: id.to_string(),
                    code,
                },
            )
            .await;
        }
    }
}
