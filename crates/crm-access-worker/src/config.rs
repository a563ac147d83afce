use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::dispatcher::{DEFAULT_CHANNEL, DispatcherConfig};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub dispatcher: DispatcherSettings,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub batch_size: usize,
    pub sweep_interval_secs: u64,
    pub reconnect_backoff_secs: u64,
    pub channel: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost:5432/crm".to_string(),
            max_connections: 10,
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            sweep_interval_secs: 30,
            reconnect_backoff_secs: 5,
            channel: DEFAULT_CHANNEL.to_string(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = config_path {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e.to_string()))?;
            toml::from_str::<AppConfig>(&contents)
                .map_err(|e| ConfigError::ParseToml(e.to_string()))?
        } else {
            AppConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CRM_ACCESS_DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("CRM_ACCESS_DATABASE_MAX_CONNECTIONS")
            && let Ok(n) = v.parse()
        {
            self.database.max_connections = n;
        }
        if let Ok(v) = std::env::var("CRM_ACCESS_DISPATCHER_BATCH_SIZE")
            && let Ok(n) = v.parse()
        {
            self.dispatcher.batch_size = n;
        }
        if let Ok(v) = std::env::var("CRM_ACCESS_DISPATCHER_SWEEP_INTERVAL_SECS")
            && let Ok(n) = v.parse()
        {
            self.dispatcher.sweep_interval_secs = n;
        }
        if let Ok(v) = std::env::var("CRM_ACCESS_DISPATCHER_RECONNECT_BACKOFF_SECS")
            && let Ok(n) = v.parse()
        {
            self.dispatcher.reconnect_backoff_secs = n;
        }
        if let Ok(v) = std::env::var("CRM_ACCESS_DISPATCHER_CHANNEL") {
            self.dispatcher.channel = v;
        }
        if let Ok(v) = std::env::var("CRM_ACCESS_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Ok(v) = std::env::var("CRM_ACCESS_LOG_FORMAT") {
            match v.as_str() {
                "json" => self.log.format = LogFormat::Json,
                "pretty" => self.log.format = LogFormat::Pretty,
                _ => {}
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database.max_connections == 0 {
            return Err(ConfigError::Validation(
                "database.max_connections must be non-zero".to_string(),
            ));
        }
        if self.dispatcher.batch_size == 0 {
            return Err(ConfigError::Validation(
                "dispatcher.batch_size must be non-zero".to_string(),
            ));
        }
        if self.dispatcher.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "dispatcher.sweep_interval_secs must be non-zero".to_string(),
            ));
        }
        if self.dispatcher.reconnect_backoff_secs == 0 {
            return Err(ConfigError::Validation(
                "dispatcher.reconnect_backoff_secs must be non-zero".to_string(),
            ));
        }
        if self.dispatcher.channel.is_empty() {
            return Err(ConfigError::Validation(
                "dispatcher.channel must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            batch_size: self.dispatcher.batch_size,
            sweep_interval: Duration::from_secs(self.dispatcher.sweep_interval_secs),
            reconnect_backoff: Duration::from_secs(self.dispatcher.reconnect_backoff_secs),
            channel: self.dispatcher.channel.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    ReadFile(String, String),

    #[error("failed to parse TOML config: {0}")]
    ParseToml(String),

    #[error("config validation failed: {0}")]
    Validation(String),
}
