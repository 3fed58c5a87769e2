//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tour_core::{TourError, TourResult};
use tracing::info;

/// What happens to a connection's sessions when it closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectPolicy {
    /// Keep the shell running, unbound, until a later `check` claims it.
    #[default]
    Detach,
    /// Kill every session bound to the connection.
    Kill,
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub terminal: TerminalSection,
    #[serde(default)]
    pub watch: WatchSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default)]
    pub debug_websocket: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            ws_path: default_ws_path(),
            max_sessions: default_max_sessions(),
            debug_websocket: false,
        }
    }
}

/// `[terminal]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalSection {
    pub shell: Option<String>,
    #[serde(default = "default_term")]
    pub term: String,
    pub workdir: Option<String>,
    #[serde(default)]
    pub on_disconnect: DisconnectPolicy,
    #[serde(default = "default_resize_per_second")]
    pub resize_per_second: u32,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for TerminalSection {
    fn default() -> Self {
        Self {
            shell: None,
            term: default_term(),
            workdir: None,
            on_disconnect: DisconnectPolicy::default(),
            resize_per_second: default_resize_per_second(),
            env: HashMap::new(),
        }
    }
}

/// `[watch]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub path: Option<String>,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

fn default_port() -> u16 {
    3000
}
fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_ws_path() -> String {
    "/ws".to_string()
}
fn default_max_sessions() -> usize {
    32
}
fn default_term() -> String {
    "xterm-256color".to_string()
}
fn default_resize_per_second() -> u32 {
    30
}
fn default_true() -> bool {
    true
}

/// Values given on the command line; each one beats the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub bind: Option<IpAddr>,
    pub max_sessions: Option<usize>,
    pub shell: Option<String>,
    pub exercises_path: Option<PathBuf>,
    pub on_disconnect: Option<DisconnectPolicy>,
    pub debug_websocket: bool,
    pub no_watch: bool,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub ws_path: String,
    pub max_sessions: usize,
    pub debug_websocket: bool,
    pub shell: Option<String>,
    pub term: String,
    pub workdir: PathBuf,
    pub env: HashMap<String, String>,
    pub on_disconnect: DisconnectPolicy,
    pub resize_per_second: u32,
    /// Exercises tree to watch, if file notifications are on.
    pub watch_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), ConfigOverrides::default())
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> TourResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| TourError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let config = Self::resolve(file_config, overrides);
        if !config.ws_path.starts_with('/') {
            return Err(TourError::Config(format!(
                "ws_path must start with '/': {}",
                config.ws_path
            )));
        }
        Ok(config)
    }

    fn resolve(file: ConfigFile, overrides: ConfigOverrides) -> Self {
        let exercises = overrides.exercises_path.map(|p| expand_tilde(&p));

        let workdir = file
            .terminal
            .workdir
            .as_deref()
            .map(expand_tilde_str)
            .or_else(|| exercises.clone())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let watch_path = if file.watch.enabled && !overrides.no_watch {
            file.watch
                .path
                .as_deref()
                .map(expand_tilde_str)
                .or(exercises)
        } else {
            None
        };

        let shell = overrides
            .shell
            .or(file.terminal.shell)
            .filter(|s| !s.trim().is_empty());

        Self {
            bind: overrides.bind.unwrap_or(file.server.bind),
            port: overrides.port.unwrap_or(file.server.port),
            ws_path: file.server.ws_path,
            max_sessions: overrides.max_sessions.unwrap_or(file.server.max_sessions),
            debug_websocket: overrides.debug_websocket || file.server.debug_websocket,
            shell,
            term: file.terminal.term,
            workdir,
            env: file.terminal.env,
            on_disconnect: overrides
                .on_disconnect
                .unwrap_or(file.terminal.on_disconnect),
            resize_per_second: file.terminal.resize_per_second,
            watch_path,
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_without_file() {
        let cfg = ServerConfig::load(None, ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.ws_path, "/ws");
        assert_eq!(cfg.term, "xterm-256color");
        assert_eq!(cfg.on_disconnect, DisconnectPolicy::Detach);
        assert_eq!(cfg.resize_per_second, 30);
        assert!(cfg.watch_path.is_none());
        assert!(cfg.shell.is_none());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig::load(
            Some(&dir.path().join("absent.toml")),
            ConfigOverrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.max_sessions, 32);
    }

    #[test]
    fn file_values_are_used() {
        let file = write_config(
            r#"
[server]
port = 4100
bind = "127.0.0.1"
max_sessions = 4

[terminal]
shell = "/bin/bash"
workdir = "/srv/exercises"
on_disconnect = "kill"
resize_per_second = 10
env = { RUST_BACKTRACE = "1" }

[watch]
path = "/srv/exercises"
"#,
        );
        let cfg = ServerConfig::load(Some(file.path()), ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.listen_addr(), "127.0.0.1:4100".parse().unwrap());
        assert_eq!(cfg.max_sessions, 4);
        assert_eq!(cfg.shell.as_deref(), Some("/bin/bash"));
        assert_eq!(cfg.workdir, PathBuf::from("/srv/exercises"));
        assert_eq!(cfg.on_disconnect, DisconnectPolicy::Kill);
        assert_eq!(cfg.resize_per_second, 10);
        assert_eq!(cfg.env.get("RUST_BACKTRACE").map(String::as_str), Some("1"));
        assert_eq!(cfg.watch_path, Some(PathBuf::from("/srv/exercises")));
    }

    #[test]
    fn cli_overrides_win() {
        let file = write_config("[server]\nport = 4100\n[terminal]\non_disconnect = \"kill\"\n");
        let overrides = ConfigOverrides {
            port: Some(5000),
            on_disconnect: Some(DisconnectPolicy::Detach),
            exercises_path: Some(PathBuf::from("/tmp/tour")),
            debug_websocket: true,
            ..ConfigOverrides::default()
        };
        let cfg = ServerConfig::load(Some(file.path()), overrides).unwrap();
        assert_eq!(cfg.port, 5000);
        assert_eq!(cfg.on_disconnect, DisconnectPolicy::Detach);
        assert!(cfg.debug_websocket);
        // No [terminal] workdir, so the exercises path is the shell's cwd.
        assert_eq!(cfg.workdir, PathBuf::from("/tmp/tour"));
        assert_eq!(cfg.watch_path, Some(PathBuf::from("/tmp/tour")));
    }

    #[test]
    fn no_watch_disables_watcher() {
        let overrides = ConfigOverrides {
            exercises_path: Some(PathBuf::from("/tmp/tour")),
            no_watch: true,
            ..ConfigOverrides::default()
        };
        let cfg = ServerConfig::load(None, overrides).unwrap();
        assert!(cfg.watch_path.is_none());
    }

    #[test]
    fn blank_shell_means_default() {
        let file = write_config("[terminal]\nshell = \"\"\n");
        let cfg = ServerConfig::load(Some(file.path()), ConfigOverrides::default()).unwrap();
        assert!(cfg.shell.is_none());
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let file = write_config("[server\nport = ");
        let err = ServerConfig::load(Some(file.path()), ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, TourError::Config(_)));
    }

    #[test]
    fn unknown_policy_is_config_error() {
        let file = write_config("[terminal]\non_disconnect = \"explode\"\n");
        let err = ServerConfig::load(Some(file.path()), ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, TourError::Config(_)));
    }

    #[test]
    fn relative_ws_path_is_rejected() {
        let file = write_config("[server]\nws_path = \"ws\"\n");
        let err = ServerConfig::load(Some(file.path()), ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, TourError::Config(_)));
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/.tour/server.toml")), home.join(".tour/server.toml"));
        }
        assert_eq!(expand_tilde(Path::new("/etc/tour.toml")), PathBuf::from("/etc/tour.toml"));
    }
}
