//! Exercise tree watcher.
//!
//! Broadcasts `file_changed` whenever a file under
//! `<root>/<chapter>/<exercise>/...` is created, modified or removed, so open
//! editors can reload.

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tour_core::{ServerMessage, TourError, TourResult};
use tracing::{debug, error, info};

use crate::connections::ConnectionRegistry;

/// Directory names never reported (build output churns constantly).
const IGNORED_DIRS: &[&str] = &["target", "node_modules"];

/// A change inside one exercise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    /// Display name of the exercise.
    pub exercise: String,
    /// Path relative to the watch root, `/`-separated.
    pub file: String,
}

impl From<FileChange> for ServerMessage {
    fn from(change: FileChange) -> Self {
        ServerMessage::FileChanged {
            exercise: change.exercise,
            file: change.file,
        }
    }
}

/// Keeps the OS watcher and its forwarding task alive.
pub struct ExerciseWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for ExerciseWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Watch `root` recursively and broadcast changes to every connection.
pub fn spawn(root: &Path, connections: Arc<ConnectionRegistry>) -> TourResult<ExerciseWatcher> {
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let (tx, mut rx) = mpsc::channel::<notify::Result<Event>>(100);

    let mut watcher = RecommendedWatcher::new(
        move |res| {
            // Full queue: drop the event, the next save will report again.
            let _ = tx.try_send(res);
        },
        Config::default(),
    )
    .map_err(|e| TourError::Other(format!("failed to create watcher: {e}")))?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|e| TourError::Other(format!("failed to watch {}: {e}", root.display())))?;

    info!(path = %root.display(), "watching exercises");

    let task = tokio::spawn(async move {
        while let Some(res) = rx.recv().await {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    error!(error = %e, "file watcher error");
                    continue;
                }
            };
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                continue;
            }
            for path in &event.paths {
                if let Some(change) = classify(&root, path) {
                    debug!(exercise = %change.exercise, file = %change.file, "file changed");
                    connections.broadcast(change.into()).await;
                }
            }
        }
    });

    Ok(ExerciseWatcher {
        _watcher: watcher,
        task,
    })
}

/// Map an absolute path to the exercise it belongs to, if any.
pub fn classify(root: &Path, path: &Path) -> Option<FileChange> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    if parts.len() < 2 {
        return None;
    }
    if parts
        .iter()
        .any(|p| p.starts_with('.') || IGNORED_DIRS.contains(&p.as_str()))
    {
        return None;
    }

    let exercise_dir: PathBuf = root.join(&parts[0]).join(&parts[1]);
    Some(FileChange {
        exercise: exercise_display_name(&exercise_dir, &parts[1]),
        file: parts.join("/"),
    })
}

/// Title from the exercise's `metadata.json`, else a name derived from the
/// directory (`ex03_slices` -> `03 slices`).
pub fn exercise_display_name(exercise_dir: &Path, dir_name: &str) -> String {
    std::fs::read_to_string(exercise_dir.join("metadata.json"))
        .ok()
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
        .and_then(|meta| meta.get("title")?.as_str().map(str::to_string))
        .unwrap_or_else(|| dir_name.replace('_', " ").replacen("ex", "", 1))
}
