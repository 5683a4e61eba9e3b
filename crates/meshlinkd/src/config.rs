//! Configuration for meshlinkd
//!
//! Settings come from an optional JSON file; command-line flags override
//! the file.

use crate::node::HeartbeatConfig;
use clap::{Parser, ValueEnum};
use meshlink_net::crypto::{SharedSecret, SECRET_LEN};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no shared secret configured")]
    MissingSecret,
    #[error("secret is not valid hex: {0}")]
    SecretEncoding(#[from] hex::FromHexError),
    #[error("secret must be {SECRET_LEN} bytes, got {0}")]
    SecretLength(usize),
    #[error("invalid setting: {0}")]
    Invalid(&'static str),
}

/// meshlinkd - encrypted peer overlay daemon
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "meshlinkd")]
#[command(about = "meshlink peer daemon: encrypted links, heartbeats and request streams")]
pub struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listen address
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Shared secret, 32 bytes hex encoded
    #[arg(long, env = "MESHLINK_SECRET", hide_env_values = true)]
    pub secret: Option<String>,

    /// Peers to dial at startup (comma-separated addresses)
    #[arg(long, value_delimiter = ',')]
    pub peers: Vec<String>,

    /// Default log filter directive (RUST_LOG wins when set)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Interval of the peer table dump in milliseconds, 0 disables it
    #[arg(long)]
    pub debug_nodes_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    /// Interval of the peer table dump in milliseconds, 0 disables it
    pub debug_nodes_ms: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            debug_nodes_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub max_failures: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 6_000,
            timeout_ms: 9_000,
            max_failures: 3,
        }
    }
}

impl From<&HeartbeatSettings> for HeartbeatConfig {
    fn from(settings: &HeartbeatSettings) -> Self {
        Self {
            interval: Duration::from_millis(settings.interval_ms),
            timeout: Duration::from_millis(settings.timeout_ms),
            max_failures: settings.max_failures,
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address
    pub listen: String,
    /// Shared secret, hex encoded
    pub secret: String,
    /// Peers to dial once at startup
    pub peers: Vec<String>,
    pub log: LogConfig,
    pub heartbeat: HeartbeatSettings,
    /// Bound on the encrypted handshake of a new connection
    pub handshake_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8909".to_string(),
            secret: String::new(),
            peers: Vec::new(),
            log: LogConfig::default(),
            heartbeat: HeartbeatSettings::default(),
            handshake_timeout_ms: 10_000,
        }
    }
}

impl Config {
    /// Load a JSON configuration file
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Build the configuration from the command line, reading the file it
    /// names first
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Self::load_file(path)?,
            None => Self::default(),
        };

        if let Some(listen) = &cli.listen {
            config.listen = listen.clone();
        }
        if let Some(secret) = &cli.secret {
            config.secret = secret.clone();
        }
        if !cli.peers.is_empty() {
            config.peers = cli.peers.clone();
        }
        if let Some(level) = &cli.log_level {
            config.log.level = level.clone();
        }
        if let Some(format) = cli.log_format {
            config.log.format = format;
        }
        if let Some(ms) = cli.debug_nodes_ms {
            config.log.debug_nodes_ms = ms;
        }
        Ok(config)
    }

    /// Decode the shared secret
    pub fn shared_secret(&self) -> Result<SharedSecret, ConfigError> {
        let hex_secret = self.secret.trim();
        if hex_secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        let bytes = hex::decode(hex_secret)?;
        SharedSecret::try_from(bytes.as_slice()).map_err(|_| ConfigError::SecretLength(bytes.len()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared_secret()?;
        if self.listen.is_empty() {
            return Err(ConfigError::Invalid("listen address cannot be empty"));
        }
        if self.heartbeat.interval_ms == 0 || self.heartbeat.timeout_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat interval and timeout must be non-zero"));
        }
        if self.heartbeat.max_failures == 0 {
            return Err(ConfigError::Invalid("heartbeat max_failures must be at least 1"));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid("handshake timeout must be non-zero"));
        }
        Ok(())
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig::from(&self.heartbeat)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Interval of the peer table dump, if enabled
    pub fn debug_nodes_interval(&self) -> Option<Duration> {
        match self.log.debug_nodes_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
