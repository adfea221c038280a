//! Agent configuration.
//!
//! Stored as TOML at `$BUNDLESTORE_AGENT_CONFIG` when set, otherwise:
//! - Linux: `~/.config/bundlestore/agent.toml`
//! - Windows: `%APPDATA%/bundlestore/agent.toml`

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bundlestore_agent_connection::CheckerConfig;
use bundlestore_data_channel::{ServerConfig, DEFAULT_AGENT_PORT};
use bundlestore_transfer::TransferConfig;
use serde::{Deserialize, Serialize};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "BUNDLESTORE_AGENT_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Display name of this agent (hostname by default).
    #[serde(default = "default_name")]
    pub name: String,

    /// Port the storage server listens on (0 = auto-assign).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// `host:port` of the master. No liveness checking when absent.
    #[serde(default)]
    pub master_addr: Option<String>,

    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,

    /// Bytes buffered between a connection and its background transfer.
    #[serde(default = "default_pipe_capacity")]
    pub pipe_capacity: usize,

    #[serde(default = "default_check_period_secs")]
    pub check_period_secs: u64,

    #[serde(default)]
    pub check_initial_delay_secs: u64,

    /// Consecutive failed probes before the master is considered gone.
    #[serde(default = "default_trip_threshold")]
    pub trip_threshold: u32,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "bundlestore-agent".into())
}

fn default_listen_port() -> u16 {
    DEFAULT_AGENT_PORT
}

fn default_max_concurrent_transfers() -> usize {
    TransferConfig::default().max_concurrent_transfers
}

fn default_pipe_capacity() -> usize {
    TransferConfig::default().pipe_capacity
}

fn default_check_period_secs() -> u64 {
    CheckerConfig::default().period.as_secs()
}

fn default_trip_threshold() -> u32 {
    CheckerConfig::default().trip_threshold
}

fn default_probe_timeout_secs() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            listen_port: default_listen_port(),
            master_addr: None,
            max_concurrent_transfers: default_max_concurrent_transfers(),
            pipe_capacity: default_pipe_capacity(),
            check_period_secs: default_check_period_secs(),
            check_initial_delay_secs: 0,
            trip_threshold: default_trip_threshold(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, creating a default file if none exists.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            max_concurrent_transfers: self.max_concurrent_transfers.max(1),
            pipe_capacity: self.pipe_capacity.max(1),
        }
    }

    pub fn checker_config(&self) -> CheckerConfig {
        CheckerConfig {
            initial_delay: Duration::from_secs(self.check_initial_delay_secs),
            period: Duration::from_secs(self.check_period_secs),
            trip_threshold: self.trip_threshold,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.listen_port)),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Resolves the configuration file path.
fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("bundlestore").join("agent.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("bundlestore")
            .join("agent.toml")
    }
}
