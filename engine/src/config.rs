//! Engine configuration.

use crate::queue::DEFAULT_RETRY_CAP;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Engine configuration, usually loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Embedded store file; `None` keeps the Local tier in memory
    pub db_path: Option<PathBuf>,
    /// Base URL of the document service
    pub remote_url: Option<String>,
    /// Bearer token sent to the document service
    pub auth_token: Option<String>,
    /// Failed retries before a queue item is dead-lettered
    pub retry_cap: u32,
    /// Period of background sync cycles
    pub sync_interval: Duration,
    /// Period of connectivity probes
    pub probe_interval: Duration,
    /// Pause before the single retry of a remote call
    pub remote_retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            remote_url: None,
            auth_token: None,
            retry_cap: DEFAULT_RETRY_CAP,
            sync_interval: Duration::from_secs(60),
            probe_interval: Duration::from_secs(15),
            remote_retry_delay: Duration::from_millis(250),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `TANDEM_*` environment variables, falling
    /// back to the defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            db_path: env::var("TANDEM_DB_PATH").ok().map(PathBuf::from),
            remote_url: env::var("TANDEM_REMOTE_URL").ok(),
            auth_token: env::var("TANDEM_AUTH_TOKEN").ok(),
            retry_cap: parse_var("TANDEM_RETRY_CAP")?.unwrap_or(defaults.retry_cap),
            sync_interval: parse_var("TANDEM_SYNC_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.sync_interval),
            probe_interval: parse_var("TANDEM_PROBE_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.probe_interval),
            remote_retry_delay: parse_var("TANDEM_REMOTE_RETRY_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.remote_retry_delay),
        })
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn with_retry_cap(mut self, retry_cap: u32) -> Self {
        self.retry_cap = retry_cap;
        self
    }

    pub fn with_remote_retry_delay(mut self, delay: Duration) -> Self {
        self.remote_retry_delay = delay;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }
}

fn parse_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        Err(_) => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a non-negative integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
}

impl From<ConfigError> for crate::Error {
    fn from(err: ConfigError) -> Self {
        crate::Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.retry_cap, 3);
        assert_eq!(config.sync_interval, Duration::from_secs(60));
        assert_eq!(config.db_path, None);
    }

    // All env manipulation lives in one test so parallel tests cannot interfere.
    #[test]
    fn from_env_reads_and_validates() {
        env::set_var("TANDEM_RETRY_CAP", "5");
        env::set_var("TANDEM_DB_PATH", "/tmp/tandem-test.db");
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.retry_cap, 5);
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/tandem-test.db")));

        env::set_var("TANDEM_SYNC_INTERVAL_SECS", "soon");
        let err = EngineConfig::from_env().unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidNumber {
                name: "TANDEM_SYNC_INTERVAL_SECS",
                value: "soon".into()
            }
        );

        env::remove_var("TANDEM_RETRY_CAP");
        env::remove_var("TANDEM_DB_PATH");
        env::remove_var("TANDEM_SYNC_INTERVAL_SECS");
    }
}
