//! Configuration management for the controller

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use timeguard_agent::config::DEFAULT_PORT;

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Port agents listen on
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Address the JSON API listens on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Scan this /24 instead of the one of the local address
    #[serde(default)]
    pub subnet: Option<Ipv4Addr>,

    /// Display names that take precedence over anything an agent reports
    #[serde(default)]
    pub names: BTreeMap<Ipv4Addr, String>,
}

/// Per-exchange timeouts, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Reachability probe during a scan
    #[serde(default = "default_probe_ms")]
    pub probe_ms: u64,
    /// GET_NAME query during a scan
    #[serde(default = "default_name_ms")]
    pub name_ms: u64,
    /// GET_STATUS refresh
    #[serde(default = "default_status_ms")]
    pub status_ms: u64,
    /// Operator commands
    #[serde(default = "default_command_ms")]
    pub command_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5000))
}

fn default_probe_ms() -> u64 {
    500
}

fn default_name_ms() -> u64 {
    1000
}

fn default_status_ms() -> u64 {
    2000
}

fn default_command_ms() -> u64 {
    5000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            probe_ms: default_probe_ms(),
            name_ms: default_name_ms(),
            status_ms: default_status_ms(),
            command_ms: default_command_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn probe(&self) -> Duration {
        Duration::from_millis(self.probe_ms)
    }

    pub fn name(&self) -> Duration {
        Duration::from_millis(self.name_ms)
    }

    pub fn status(&self) -> Duration {
        Duration::from_millis(self.status_ms)
    }

    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            timeouts: TimeoutConfig::default(),
            listen: default_listen(),
            subnet: None,
            names: BTreeMap::new(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(port) = env_parse("TIMEGUARD_PORT")? {
            config.port = port;
        }
        if let Some(ms) = env_parse("TIMEGUARD_PROBE_TIMEOUT_MS")? {
            config.timeouts.probe_ms = ms;
        }
        if let Some(ms) = env_parse("TIMEGUARD_NAME_TIMEOUT_MS")? {
            config.timeouts.name_ms = ms;
        }
        if let Some(ms) = env_parse("TIMEGUARD_STATUS_TIMEOUT_MS")? {
            config.timeouts.status_ms = ms;
        }
        if let Some(ms) = env_parse("TIMEGUARD_COMMAND_TIMEOUT_MS")? {
            config.timeouts.command_ms = ms;
        }
        if let Some(listen) = env_parse("TIMEGUARD_LISTEN")? {
            config.listen = listen;
        }
        if let Some(subnet) = env_parse("TIMEGUARD_SUBNET")? {
            config.subnet = Some(subnet);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("~/.config"));
        config_dir.join("timeguard").join("controller.yaml")
    }

    /// Load from default locations (file first, then env)
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::default_config_path();

        if config_path.exists() {
            Self::from_file(&config_path)
        } else {
            Self::from_env()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.timeouts;
        if [t.probe_ms, t.name_ms, t.status_ms, t.command_ms].contains(&0) {
            return Err(ConfigError::Invalid("timeouts must be > 0".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvVar {
                name: name.to_string(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    InvalidEnvVar { name: String, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
