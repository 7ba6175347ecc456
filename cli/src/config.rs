// Configuration management for the versus CLI
//
// Cross-platform config stored in:
// - macOS: ~/.config/versus/config.json
// - Linux: ~/.config/versus/config.json
// - Windows: %APPDATA%\versus\config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default rendezvous broker when neither the config file nor the command
/// line names one.
pub const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:7271";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Rendezvous broker address (host:port)
    pub broker_addr: String,

    /// Storage path for the vote ledger; defaults to the platform data dir
    pub storage_path: Option<String>,

    /// Network settings
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Maximum number of peers to hold per battle
    pub max_connections: usize,

    /// Per-connection handshake timeout in seconds
    pub handshake_timeout: u64,

    /// Heartbeat interval in seconds
    pub heartbeat_interval: u64,

    /// Overall discovery deadline in seconds
    pub discovery_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_addr: DEFAULT_BROKER_ADDR.to_string(),
            storage_path: None,
            network: NetworkConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let defaults = versus_core::SyncConfig::default();
        Self {
            max_connections: defaults.max_connections,
            handshake_timeout: defaults.handshake_timeout.as_secs(),
            heartbeat_interval: defaults.heartbeat_interval.as_secs(),
            discovery_timeout: defaults.discovery_timeout.as_secs(),
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("versus");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = match &self.storage_path {
            Some(path) => PathBuf::from(path),
            None => dirs::data_local_dir()
                .context("Failed to determine data directory")?
                .join("versus"),
        };

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let contents =
                std::fs::read_to_string(&config_file).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let config_file = Self::config_file()?;
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_file, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Translate the persisted network knobs into the core's config.
    pub fn sync_config(&self) -> versus_core::SyncConfig {
        use std::time::Duration;
        versus_core::SyncConfig {
            max_connections: self.network.max_connections,
            handshake_timeout: Duration::from_secs(self.network.handshake_timeout),
            heartbeat_interval: Duration::from_secs(self.network.heartbeat_interval),
            discovery_timeout: Duration::from_secs(self.network.discovery_timeout),
            ..versus_core::SyncConfig::default()
        }
    }
}
