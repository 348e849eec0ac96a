//! Configuration system for Shuttle.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SHUTTLE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/shuttle/config.toml
//!   3. ~/.config/shuttle/config.toml

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuttleConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub transfer: TransferConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Account id both devices must agree on. Empty = `$USER`.
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the sender listens on.
    pub bind_address: IpAddr,
    /// Ephemeral port range for the transfer listener (inclusive).
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Random ports tried before giving up.
    pub max_port_attempts: u32,
    /// Probe local-network permission before listening. Disable on platforms
    /// without a permission model.
    pub probe_permission: bool,
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes the sender may have queued for the socket at once.
    pub max_in_flight_bytes: u64,
    /// How long the sender waits for budget before sending anyway.
    pub wait_timeout_secs: u64,
    /// Envelope bytes per file frame.
    pub file_chunk_size: usize,
    /// Receiver progress report interval.
    pub progress_interval_ms: u64,
    /// Idle read timeout on either side. 0 = none.
    pub receive_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Where received snapshots are restored.
    pub output_dir: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            user_id: std::env::var("USER").unwrap_or_default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_range_start: 49152,
            port_range_end: 65535,
            max_port_attempts: 10,
            probe_permission: false,
            probe_timeout_ms: 2000,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_in_flight_bytes: 100 * 1024 * 1024, // 100 MiB
            wait_timeout_secs: 10,
            file_chunk_size: 64 * 1024,
            progress_interval_ms: 1000,
            receive_timeout_secs: 60,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: data_dir().join("received"),
        }
    }
}

impl NetworkConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl TransferConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        (self.receive_timeout_secs > 0).then(|| Duration::from_secs(self.receive_timeout_secs))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("shuttle")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("shuttle")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid port range {0}..={1}")]
    InvalidPortRange(u16, u16),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ShuttleConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ShuttleConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SHUTTLE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&ShuttleConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let (start, end) = (self.network.port_range_start, self.network.port_range_end);
        if start == 0 || start > end {
            return Err(ConfigError::InvalidPortRange(start, end));
        }
        Ok(())
    }

    /// Apply SHUTTLE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SHUTTLE_IDENTITY__USER_ID") {
            self.identity.user_id = v;
        }
        if let Ok(v) = std::env::var("SHUTTLE_NETWORK__PROBE_PERMISSION") {
            self.network.probe_permission = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("SHUTTLE_TRANSFER__MAX_IN_FLIGHT_BYTES") {
            if let Ok(n) = v.parse() {
                self.transfer.max_in_flight_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("SHUTTLE_TRANSFER__WAIT_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.transfer.wait_timeout_secs = n;
            }
        }
    }
}
