//! In-memory pty backend for tests. Each spawn records a [`MockProcess`]
//! handle the test drives directly: emit output, finish the process, inspect
//! what the registry wrote.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tour_core::{TourError, TourResult};

use super::pty::{PtyBackend, PtyEvents, PtyProcess, SpawnSpec};

/// Shared state of one fake shell.
pub struct MockProcess {
    output: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    exit: Mutex<Option<oneshot::Sender<Option<i32>>>>,
    written: Mutex<Vec<u8>>,
    size: Mutex<(u16, u16)>,
    kills: AtomicUsize,
    spec: SpawnSpec,
}

impl MockProcess {
    /// Produce output as if the shell printed `bytes`.
    pub fn emit(&self, bytes: &[u8]) {
        if let Some(tx) = self.output.lock().unwrap().as_ref() {
            let _ = tx.try_send(bytes.to_vec());
        }
    }

    /// End the process: close output, then fire exit with `code`.
    pub fn exit(&self, code: Option<i32>) {
        self.output.lock().unwrap().take();
        if let Some(tx) = self.exit.lock().unwrap().take() {
            let _ = tx.send(code);
        }
    }

    /// Fire exit with `code` but keep the output side open, like a
    /// background job still writing after the shell is gone.
    pub fn reap(&self, code: Option<i32>) {
        if let Some(tx) = self.exit.lock().unwrap().take() {
            let _ = tx.send(code);
        }
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub fn size(&self) -> (u16, u16) {
        *self.size.lock().unwrap()
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn spec(&self) -> &SpawnSpec {
        &self.spec
    }
}

struct MockHandle(Arc<MockProcess>);

impl PtyProcess for MockHandle {
    fn write(&mut self, data: &[u8]) -> TourResult<()> {
        self.0.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> TourResult<()> {
        *self.0.size.lock().unwrap() = (cols, rows);
        Ok(())
    }

    fn kill(&mut self) -> TourResult<()> {
        self.0.kills.fetch_add(1, Ordering::SeqCst);
        self.0.exit(None);
        Ok(())
    }
}

/// Backend whose shells live entirely in memory.
#[derive(Default)]
pub struct MockBackend {
    processes: Mutex<Vec<Arc<MockProcess>>>,
    fail: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following spawn fail.
    pub fn fail_spawns(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn spawn_count(&self) -> usize {
        self.processes.lock().unwrap().len()
    }

    /// The `index`-th spawned process.
    pub fn process(&self, index: usize) -> Arc<MockProcess> {
        self.processes.lock().unwrap()[index].clone()
    }
}

impl PtyBackend for MockBackend {
    fn spawn(&self, spec: &SpawnSpec) -> TourResult<(Box<dyn PtyProcess>, PtyEvents)> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TourError::Spawn("mock spawn failure".into()));
        }
        let (output_tx, output_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = oneshot::channel();
        let process = Arc::new(MockProcess {
            output: Mutex::new(Some(output_tx)),
            exit: Mutex::new(Some(exit_tx)),
            written: Mutex::new(Vec::new()),
            size: Mutex::new((spec.cols, spec.rows)),
            kills: AtomicUsize::new(0),
            spec: spec.clone(),
        });
        self.processes.lock().unwrap().push(process.clone());
        Ok((
            Box::new(MockHandle(process)),
            PtyEvents {
                output: output_rx,
                exit: exit_rx,
            },
        ))
    }
}
