// Coordinator configuration
//
// Layered with the `config` crate: built-in defaults, then an optional file
// (format picked from its extension), then TXCOORD_* environment variables.

use config::{Config, ConfigError, Environment, File};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides, e.g. `TXCOORD_STALE_RETRY_LIMIT=5`
pub const ENV_PREFIX: &str = "TXCOORD";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// First retry delay for participant RPCs
    pub backoff_initial_ms: u64,

    /// Retry delay ceiling
    pub backoff_max_ms: u64,

    /// Abort if prepare has not finished within this bound (kPreparing only)
    pub prepare_deadline_ms: Option<u64>,

    /// Stale-epoch replies tolerated per participant during prepare
    pub stale_retry_limit: u32,

    /// Recently finished decisions remembered for duplicate commit calls
    pub finished_cache_capacity: usize,

    /// Return from coordinateCommitTransaction as soon as the decision is durable
    pub return_after_decision_persisted: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            backoff_initial_ms: 10,
            backoff_max_ms: 1_000,
            prepare_deadline_ms: None,
            stale_retry_limit: 10,
            finished_cache_capacity: 1_024,
            return_after_decision_persisted: true,
        }
    }
}

impl CoordinatorConfig {
    /// Load defaults, the optional file, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let config: CoordinatorConfig = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        debug!("effective coordinator config: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_initial_ms == 0 {
            return Err(ConfigError::Message(
                "backoff_initial_ms must be positive".to_string(),
            ));
        }
        if self.backoff_max_ms < self.backoff_initial_ms {
            return Err(ConfigError::Message(format!(
                "backoff_max_ms ({}) is below backoff_initial_ms ({})",
                self.backoff_max_ms, self.backoff_initial_ms
            )));
        }
        if self.finished_cache_capacity == 0 {
            return Err(ConfigError::Message(
                "finished_cache_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn prepare_deadline(&self) -> Option<Duration> {
        self.prepare_deadline_ms.map(Duration::from_millis)
    }
}
