//! Engine settings
//!
//! Where things live on the host and how the engine behaves. The desired
//! state itself (users, groups, chroot policy) comes from the separate JSON
//! document named by `desired_state_path`.

use clap::ValueEnum;
use heron_core::{HeronError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pam::DEFAULT_EVENT_URL;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// JSON document describing users, groups and global policy
    #[serde(default = "default_desired_state_path")]
    pub desired_state_path: PathBuf,

    /// Seconds between modification checks of the document (0 disables)
    #[serde(default = "default_reload_poll_secs")]
    pub reload_poll_secs: u64,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub commands: CommandsConfig,

    #[serde(default)]
    pub pam: PamConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Listen address of the session event endpoint
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:25080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Live host keys and daemon configuration directory
    pub ssh_dir: PathBuf,
    /// Persistent host keys, copied into `ssh_dir` on every start
    pub keys_import_dir: PathBuf,
    /// Rendered daemon configuration
    pub sshd_config: PathBuf,
    /// Parent of every managed home directory
    pub home_base: PathBuf,
    pub sshd_binary: PathBuf,
    pub pam_dir: PathBuf,
    /// Engine bookkeeping that must survive restarts
    pub state_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            ssh_dir: PathBuf::from("/etc/ssh"),
            keys_import_dir: PathBuf::from("/etc/ssh/keys"),
            sshd_config: PathBuf::from("/etc/ssh/sshd_config"),
            home_base: PathBuf::from("/home"),
            sshd_binary: PathBuf::from("/usr/sbin/sshd"),
            pam_dir: PathBuf::from("/etc/pam.d"),
            state_dir: PathBuf::from("/var/lib/heron"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Upper bound for any external command; expiry counts as failure
    pub timeout_secs: u64,
    /// Exit codes of `killall` that mean "stopped" or "nothing running"
    pub kill_accepted_exit_codes: Vec<i32>,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            kill_accepted_exit_codes: vec![0, 1],
        }
    }
}

impl CommandsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PamConfig {
    /// Install the `pam_exec` session hook at startup
    pub install_hook: bool,
    /// URL the hook script calls on every session event
    pub event_url: String,
}

impl Default for PamConfig {
    fn default() -> Self {
        Self {
            install_hook: true,
            event_url: DEFAULT_EVENT_URL.to_string(),
        }
    }
}

/// Logging configuration
///
/// NIST 800-53: AU-2 (Audit Events), AU-12 (Audit Generation)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text or json)
    pub format: LogFormat,
    /// Optional log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for log aggregators
    Json,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            desired_state_path: default_desired_state_path(),
            reload_poll_secs: default_reload_poll_secs(),
            http: HttpConfig::default(),
            paths: PathsConfig::default(),
            commands: CommandsConfig::default(),
            pam: PamConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HeronError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| HeronError::Config(format!("Failed to parse config: {e}")))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| HeronError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.commands.timeout_secs == 0 {
            return Err(HeronError::Config(
                "commands.timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.commands.kill_accepted_exit_codes.is_empty() {
            return Err(HeronError::Config(
                "commands.kill_accepted_exit_codes must not be empty".to_string(),
            ));
        }

        for (name, path) in [
            ("paths.home_base", &self.paths.home_base),
            ("paths.ssh_dir", &self.paths.ssh_dir),
            ("paths.sshd_config", &self.paths.sshd_config),
            ("paths.state_dir", &self.paths.state_dir),
        ] {
            if !path.is_absolute() {
                return Err(HeronError::Config(format!(
                    "{} must be an absolute path: {:?}",
                    name, path
                )));
            }
        }

        if self.pam.install_hook && self.pam.event_url.trim().is_empty() {
            return Err(HeronError::Config(
                "pam.event_url is required when pam.install_hook is enabled".to_string(),
            ));
        }

        Ok(())
    }
}

fn default_desired_state_path() -> PathBuf {
    PathBuf::from("/app/config/sftp.json")
}

fn default_reload_poll_secs() -> u64 {
    5
}
