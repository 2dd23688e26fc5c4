use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
    /// Capacity of the task status broadcast channel.
    #[serde(default = "default_update_capacity")]
    pub update_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Per-client buffer of transports built by `Gateway::channel_transport`.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            result_ttl_secs: default_result_ttl_secs(),
            update_capacity: default_update_capacity(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            history_capacity: default_history_capacity(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl GatewayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

impl CoreConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Read a JSON config file, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_json_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply `MNEMOSYNE_*` overrides from an arbitrary lookup. Values that
    /// are blank or fail to parse are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        override_from(&lookup, "MNEMOSYNE_MAX_WORKERS", &mut self.scheduler.max_workers);
        override_from(
            &lookup,
            "MNEMOSYNE_RESULT_TTL_SECS",
            &mut self.scheduler.result_ttl_secs,
        );
        override_from(
            &lookup,
            "MNEMOSYNE_HEARTBEAT_INTERVAL_MS",
            &mut self.gateway.heartbeat_interval_ms,
        );
        override_from(
            &lookup,
            "MNEMOSYNE_HEARTBEAT_TIMEOUT_MS",
            &mut self.gateway.heartbeat_timeout_ms,
        );
        override_from(
            &lookup,
            "MNEMOSYNE_HISTORY_CAPACITY",
            &mut self.gateway.history_capacity,
        );
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_workers == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_workers must be greater than 0".to_string(),
            ));
        }
        if self.scheduler.update_capacity == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.update_capacity must be greater than 0".to_string(),
            ));
        }
        if self.gateway.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "gateway.heartbeat_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.gateway.heartbeat_timeout_ms <= self.gateway.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "gateway.heartbeat_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.gateway.heartbeat_timeout_ms, self.gateway.heartbeat_interval_ms
            )));
        }
        if self.gateway.history_capacity == 0 {
            return Err(ConfigError::Invalid(
                "gateway.history_capacity must be greater than 0".to_string(),
            ));
        }
        if self.gateway.outbound_buffer == 0 {
            return Err(ConfigError::Invalid(
                "gateway.outbound_buffer must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn override_from<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) if raw.trim().is_empty() => {}
        Err(_) => tracing::warn!("ignoring invalid value for {key}: {raw}"),
    }
}

fn default_max_workers() -> usize {
    5
}

fn default_result_ttl_secs() -> u64 {
    3600
}

fn default_update_capacity() -> usize {
    1024
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    90_000
}

fn default_history_capacity() -> usize {
    1000
}

fn default_outbound_buffer() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = CoreConfig::from_json_str("{}").unwrap();
        assert_eq!(config, CoreConfig::default());
        assert_eq!(config.scheduler.max_workers, 5);
        assert_eq!(config.gateway.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.gateway.heartbeat_timeout(), Duration::from_secs(90));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config =
            CoreConfig::from_json_str(r#"{"gateway": {"history_capacity": 10}}"#).unwrap();
        assert_eq!(config.gateway.history_capacity, 10);
        assert_eq!(config.gateway.outbound_buffer, 100);
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn test_overrides_ignore_garbage() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MNEMOSYNE_MAX_WORKERS", "8"),
            ("MNEMOSYNE_HEARTBEAT_INTERVAL_MS", "not-a-number"),
            ("MNEMOSYNE_HISTORY_CAPACITY", " 50 "),
        ]);
        let mut config = CoreConfig::default();
        config.apply_overrides_from(|key| env.get(key).map(|value| value.to_string()));

        assert_eq!(config.scheduler.max_workers, 8);
        assert_eq!(config.gateway.heartbeat_interval_ms, 30_000);
        assert_eq!(config.gateway.history_capacity, 50);
    }

    #[test]
    fn test_validate_rejects_timeout_below_interval() {
        let mut config = CoreConfig::default();
        config.gateway.heartbeat_timeout_ms = 1000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = CoreConfig::default();
        config.scheduler.max_workers = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"scheduler": {{"max_workers": 2}}}}"#).unwrap();
        let config = CoreConfig::load(file.path()).unwrap();
        assert!(config.scheduler.max_workers >= 1);
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            CoreConfig::load(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
