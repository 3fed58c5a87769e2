//! Persistence for the terminal's session id.
//!
//! The browser keeps the id in `localStorage`; native clients keep it in a
//! one-line file so reopening the terminal reattaches to the same shell.

use std::path::{Path, PathBuf};
use tour_core::TourResult;
use tracing::debug;

/// Where the current session id lives between runs.
pub trait SessionStore: Send {
    /// The saved id, if any. Unreadable storage counts as empty.
    fn load(&self) -> Option<String>;
    fn save(&mut self, session_id: &str) -> TourResult<()>;
    fn clear(&mut self) -> TourResult<()>;
}

/// Session id kept in a file containing just the id.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.tour/terminal-session`, or a relative file when there is no home.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|home| home.join(".tour"))
            .unwrap_or_else(|| PathBuf::from(".tour"))
            .join("terminal-session")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Option<String> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        let id = raw.trim();
        (!id.is_empty()).then(|| id.to_string())
    }

    fn save(&mut self, session_id: &str) -> TourResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, format!("{session_id}\n"))?;
        debug!(path = %self.path.display(), session_id, "session id saved");
        Ok(())
    }

    fn clear(&mut self) -> TourResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store, for tests and embedders without a filesystem.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    id: Option<String>,
}

impl MemorySessionStore {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self { id: Some(id.into()) }
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Option<String> {
        self.id.clone()
    }

    fn save(&mut self, session_id: &str) -> TourResult<()> {
        self.id = Some(session_id.to_string());
        Ok(())
    }

    fn clear(&mut self) -> TourResult<()> {
        self.id = None;
        Ok(())
    }
}
