//! Client configuration at `~/.tour/client.toml`.
//!
//! ```toml
//! [default]
//! url = "ws://localhost:3000/ws"
//! state_file = "~/.tour/terminal-session"
//! ```
//!
//! CLI flags always override config file values.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tour_client::FileSessionStore;
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub default: DefaultConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefaultConfig {
    /// Server WebSocket URL.
    #[serde(default = "default_url")]
    pub url: String,

    /// Where the session id is kept. `~` is expanded.
    #[serde(default)]
    pub state_file: Option<String>,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            state_file: None,
        }
    }
}

fn default_url() -> String {
    "ws://localhost:3000/ws".to_string()
}

/// `~/.tour/client.toml`
pub fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".tour")
        .join("client.toml")
}

impl Config {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &str) -> Result<Self> {
        let path = expand_tilde(path);
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// The state file to use: the flag, else the config, else the default.
    pub fn state_file(&self, flag: Option<PathBuf>) -> PathBuf {
        flag.or_else(|| self.default.state_file.as_deref().map(expand_tilde))
            .unwrap_or_else(FileSessionStore::default_path)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().unwrap_or_default().join(rest),
        None => Path::new(path).to_path_buf(),
    }
}
