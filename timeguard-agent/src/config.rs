//! Configuration management for the agent

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Port agents listen on unless configured otherwise
pub const DEFAULT_PORT: u16 = 9999;

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Address the command server binds to
    #[serde(default = "default_bind")]
    pub bind: IpAddr,

    /// Command server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds a connection may stay silent before a keepalive is sent
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Local enforcement settings
    #[serde(default)]
    pub enforcement: EnforcementConfig,

    /// Optional log file, written in addition to stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementConfig {
    /// How often the real session lock state is polled
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Warning lead time before an automatic lock
    #[serde(default = "default_warning_lead")]
    pub warning_lead_secs: u64,

    /// Delay handed to the OS when SHUTDOWN is received
    #[serde(default = "default_shutdown_delay")]
    pub shutdown_delay_secs: u64,
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    3
}

fn default_warning_lead() -> u64 {
    60
}

fn default_shutdown_delay() -> u64 {
    60
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            warning_lead_secs: default_warning_lead(),
            shutdown_delay_secs: default_shutdown_delay(),
        }
    }
}

impl EnforcementConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn warning_lead(&self) -> Duration {
        Duration::from_secs(self.warning_lead_secs)
    }

    pub fn shutdown_delay(&self) -> Duration {
        Duration::from_secs(self.shutdown_delay_secs)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            idle_timeout_secs: default_idle_timeout(),
            enforcement: EnforcementConfig::default(),
            log_file: None,
        }
    }
}

impl AgentConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(bind) = env_parse("TIMEGUARD_BIND")? {
            config.bind = bind;
        }
        if let Some(port) = env_parse("TIMEGUARD_PORT")? {
            config.port = port;
        }
        if let Some(idle) = env_parse("TIMEGUARD_IDLE_TIMEOUT")? {
            config.idle_timeout_secs = idle;
        }
        if let Some(poll) = env_parse("TIMEGUARD_POLL_INTERVAL")? {
            config.enforcement.poll_interval_secs = poll;
        }
        if let Some(lead) = env_parse("TIMEGUARD_WARNING_LEAD")? {
            config.enforcement.warning_lead_secs = lead;
        }
        if let Some(delay) = env_parse("TIMEGUARD_SHUTDOWN_DELAY")? {
            config.enforcement.shutdown_delay_secs = delay;
        }
        config.log_file = std::env::var("TIMEGUARD_LOG_FILE").ok().map(PathBuf::from);

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
        config_dir.join("timeguard").join("agent.yaml")
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

    /// Reject values that would turn a timer into a busy loop
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("idle_timeout_secs must be > 0".into()));
        }
        if self.enforcement.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "enforcement.poll_interval_secs must be > 0".into(),
            ));
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
