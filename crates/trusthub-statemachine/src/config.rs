// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-entity-type engine configuration.

use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Default number of entities selected per poll cycle.
pub const DEFAULT_BATCH_SIZE: usize = 5;
/// Default pause between poll cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Default lease duration. Must exceed the slowest expected handler.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);

/// Configuration of one [`ProcessEngine`](crate::engine::ProcessEngine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum entities selected per poll cycle.
    pub batch_size: usize,
    /// Pause between poll cycles.
    pub poll_interval: Duration,
    /// How long a lease protects an entity while its handler runs.
    pub lease_duration: Duration,
    /// Backoff and retry budget.
    pub retry: RetryPolicy,
    /// Entities of one batch processed at the same time (1 = sequential).
    pub concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            lease_duration: DEFAULT_LEASE_DURATION,
            retry: RetryPolicy::default(),
            concurrency: 1,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to
    /// `defaults` for unset ones.
    ///
    /// Environment variables (with `prefix = "TRUSTHUB_ISSUANCE"`):
    /// - `TRUSTHUB_ISSUANCE_BATCH_SIZE`
    /// - `TRUSTHUB_ISSUANCE_POLL_INTERVAL_MS`
    /// - `TRUSTHUB_ISSUANCE_LEASE_DURATION_MS`
    /// - `TRUSTHUB_ISSUANCE_MAX_RETRIES`
    /// - `TRUSTHUB_ISSUANCE_BASE_DELAY_MS`
    /// - `TRUSTHUB_ISSUANCE_MAX_DELAY_MS`
    /// - `TRUSTHUB_ISSUANCE_CONCURRENCY`
    pub fn from_env_or(prefix: &str, defaults: Self) -> Result<Self, ConfigError> {
        let millis = |suffix: &str| {
            env_var::<u64>(prefix, suffix).map(|v| v.map(Duration::from_millis))
        };

        let config = Self {
            batch_size: env_var(prefix, "BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            poll_interval: millis("POLL_INTERVAL_MS")?.unwrap_or(defaults.poll_interval),
            lease_duration: millis("LEASE_DURATION_MS")?.unwrap_or(defaults.lease_duration),
            retry: RetryPolicy {
                max_retries: env_var(prefix, "MAX_RETRIES")?
                    .unwrap_or(defaults.retry.max_retries),
                base_delay: millis("BASE_DELAY_MS")?.unwrap_or(defaults.retry.base_delay),
                max_delay: millis("MAX_DELAY_MS")?.unwrap_or(defaults.retry.max_delay),
            },
            concurrency: env_var(prefix, "CONCURRENCY")?.unwrap_or(defaults.concurrency),
        };
        config.validate()?;
        Ok(config)
    }

    /// [`from_env_or`](Self::from_env_or) with [`EngineConfig::default`].
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_env_or(prefix, Self::default())
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be greater than zero"));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be greater than zero"));
        }
        if self.lease_duration.is_zero() {
            return Err(ConfigError::Invalid("lease_duration must be greater than zero"));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(ConfigError::Invalid("max_delay must not be smaller than base_delay"));
        }
        Ok(())
    }
}

/// Read and parse `{prefix}_{suffix}`; `None` when unset.
pub fn env_var<T: FromStr>(prefix: &str, suffix: &str) -> Result<Option<T>, ConfigError> {
    let name = format!("{prefix}_{suffix}");
    match std::env::var(&name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue {
        /// Variable name.
        name: String,
        /// Raw value.
        value: String,
    },
    /// The configuration is inconsistent.
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
