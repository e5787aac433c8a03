use basalt_occ::RetryPolicy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BasaltConfig {
    #[serde(default = "defaults::shm_file_path")]
    pub shm_file_path: String,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    /// Bytes reserved for the payload after the control block.
    #[serde(default = "defaults::payload_len")]
    pub payload_len: usize,
    /// Beats the publisher writes before requesting stop.
    #[serde(default = "defaults::heartbeats")]
    pub heartbeats: u64,
    #[serde(default = "defaults::publish_interval_us")]
    pub publish_interval_us: u64,
    #[serde(default = "defaults::spin_timeout_ms")]
    pub spin_timeout_ms: u64,
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
}

mod defaults {
    pub fn shm_file_path() -> String {
        "/tmp/basalt_state".into()
    }

    pub fn log_level() -> String {
        "info".into()
    }

    pub fn payload_len() -> usize {
        64
    }

    pub fn heartbeats() -> u64 {
        10_000
    }

    pub fn publish_interval_us() -> u64 {
        1_000
    }

    pub fn spin_timeout_ms() -> u64 {
        5_000
    }

    pub fn max_attempts() -> u32 {
        100
    }
}

impl Default for BasaltConfig {
    fn default() -> Self {
        Self {
            shm_file_path: defaults::shm_file_path(),
            log_level: defaults::log_level(),
            payload_len: defaults::payload_len(),
            heartbeats: defaults::heartbeats(),
            publish_interval_us: defaults::publish_interval_us(),
            spin_timeout_ms: defaults::spin_timeout_ms(),
            max_attempts: defaults::max_attempts(),
        }
    }
}

impl BasaltConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&toml_to_str)
    }

    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        let config: BasaltConfig = toml::from_str(toml_str)?;
        if config.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(config)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_micros(self.publish_interval_us)
    }

    pub fn spin_timeout(&self) -> Duration {
        Duration::from_millis(self.spin_timeout_ms)
    }

    /// Bound for write claims: whichever of `max_attempts` and
    /// `spin_timeout_ms` runs out first.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::attempts(self.max_attempts.max(1)).with_timeout(self.spin_timeout())
    }
}
