//! Study configuration.
//!
//! All knobs live in one [`StudyConfig`] struct, loadable from a TOML file
//! with every field defaulted, so a bare `dht-vigil` run works against a
//! daemon on the default local port. Values are validated once at startup;
//! the rest of the crate trusts them.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tokio::time::Duration;

use crate::protocol::MAX_PAYLOAD_BYTES;
use crate::scheduler::SchedulerSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything a study run needs to know, with workable defaults.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StudyConfig {
    /// Seconds between probe round starts.
    pub probe_interval_secs: u64,
    /// Probes in flight at once within a round.
    pub max_concurrent_probes: usize,
    /// Consecutive absent probes before a record is declared gone.
    pub consecutive_miss_threshold: u32,
    /// Extra attempts after the first when a probe errors.
    pub max_retries_per_probe: u32,
    /// First retry delay in milliseconds; doubles per attempt.
    pub retry_backoff_base_millis: u64,
    /// Overall study length in seconds, measured from run start.
    pub study_duration_secs: u64,
    /// Seconds an in-flight round may run past the deadline or a shutdown
    /// request before it is abandoned.
    pub shutdown_grace_secs: u64,
    /// How many records the study population holds.
    pub population_size: usize,
    /// Smallest seeded payload in bytes.
    pub payload_min_bytes: usize,
    /// Largest seeded payload in bytes. Capped at
    /// [`MAX_PAYLOAD_BYTES`](crate::protocol::MAX_PAYLOAD_BYTES) so every
    /// seeded record fits a single wire frame.
    pub payload_max_bytes: usize,
    /// Subkey slots per created record.
    pub subkey_count: u16,
    /// Address of the DHT daemon's client API.
    pub daemon_addr: SocketAddr,
    /// Per-request timeout toward the daemon, in seconds.
    pub request_timeout_secs: u64,
    /// Where the observation log lives.
    pub observation_log: PathBuf,
    /// Where the population manifest lives.
    pub population_manifest: PathBuf,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 3600,
            max_concurrent_probes: 8,
            consecutive_miss_threshold: 3,
            max_retries_per_probe: 3,
            retry_backoff_base_millis: 250,
            study_duration_secs: 604_800,
            shutdown_grace_secs: 5,
            population_size: 10,
            payload_min_bytes: 1,
            payload_max_bytes: 32_000,
            subkey_count: 1,
            daemon_addr: SocketAddr::from(([127, 0, 0, 1], 5959)),
            request_timeout_secs: 30,
            observation_log: PathBuf::from("observations.jsonl"),
            population_manifest: PathBuf::from("population.jsonl"),
        }
    }
}

impl StudyConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the rest of the crate cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe_interval_secs == 0 {
            return Err(invalid("probe_interval_secs must be nonzero"));
        }
        if self.max_concurrent_probes == 0 {
            return Err(invalid("max_concurrent_probes must be nonzero"));
        }
        if self.consecutive_miss_threshold == 0 {
            return Err(invalid("consecutive_miss_threshold must be nonzero"));
        }
        if self.retry_backoff_base_millis == 0 {
            return Err(invalid("retry_backoff_base_millis must be nonzero"));
        }
        if self.study_duration_secs == 0 {
            return Err(invalid("study_duration_secs must be nonzero"));
        }
        if self.subkey_count == 0 {
            return Err(invalid("subkey_count must be nonzero"));
        }
        if self.request_timeout_secs == 0 {
            return Err(invalid("request_timeout_secs must be nonzero"));
        }
        if self.payload_min_bytes == 0 || self.payload_min_bytes > self.payload_max_bytes {
            return Err(invalid(
                "payload bounds must satisfy 1 <= payload_min_bytes <= payload_max_bytes",
            ));
        }
        if self.payload_max_bytes > MAX_PAYLOAD_BYTES {
            return Err(ConfigError::Invalid(format!(
                "payload_max_bytes {} exceeds the wire limit of {MAX_PAYLOAD_BYTES} bytes",
                self.payload_max_bytes
            )));
        }
        Ok(())
    }

    /// The scheduler's view of this config.
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            probe_interval: Duration::from_secs(self.probe_interval_secs),
            max_concurrent_probes: self.max_concurrent_probes,
            max_retries_per_probe: self.max_retries_per_probe,
            retry_backoff_base: Duration::from_millis(self.retry_backoff_base_millis),
            study_duration: Duration::from_secs(self.study_duration_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }

    /// Per-request timeout toward the daemon.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}
