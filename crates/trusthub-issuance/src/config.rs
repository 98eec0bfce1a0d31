// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hub configuration loaded from environment variables.

use std::time::Duration;

use trusthub_statemachine::config::env_var;
use trusthub_statemachine::{ConfigError, EngineConfig, RetryPolicy};
use uuid::Uuid;

use crate::holder;

const PREFIX: &str = "TRUSTHUB";

/// Default number of handlers running at once across the three engines.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 8;

/// Default grace period for engines on shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration of a [`TrustHub`](crate::hub::TrustHub).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustHubConfig {
    /// `sqlite:` or `postgres://` URL; `None` keeps entities in memory.
    pub database_url: Option<String>,
    /// Lease holder id shared by this instance's engines.
    pub instance_id: String,
    /// How long shutdown waits for engines to stop.
    pub shutdown_timeout: Duration,
    /// Handlers running at once across all engines.
    pub max_concurrent_handlers: usize,
    /// How long a holder request waits for the issuer before failing.
    pub holder_status_timeout: Duration,
    /// Engine settings of issuance processes.
    pub issuance: EngineConfig,
    /// Engine settings of holder credential requests.
    pub holder_request: EngineConfig,
    /// Engine settings of status-list publication jobs.
    pub status_list: EngineConfig,
}

impl Default for TrustHubConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            instance_id: Uuid::new_v4().to_string(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            holder_status_timeout: holder::DEFAULT_STATUS_TIMEOUT,
            issuance: EngineConfig::default(),
            holder_request: holder_request_defaults(),
            status_list: EngineConfig::default(),
        }
    }
}

fn holder_request_defaults() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            max_retries: holder::DEFAULT_MAX_RETRIES,
            ..RetryPolicy::default()
        },
        ..EngineConfig::default()
    }
}

impl TrustHubConfig {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional; see the crate documentation for the list.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let secs = |suffix: &str| {
            env_var::<u64>(PREFIX, suffix).map(|v| v.map(Duration::from_secs))
        };

        let database_url = std::env::var("TRUSTHUB_DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let config = Self {
            database_url,
            instance_id: env_var(PREFIX, "INSTANCE_ID")?.unwrap_or(defaults.instance_id),
            shutdown_timeout: secs("SHUTDOWN_TIMEOUT_SECS")?.unwrap_or(defaults.shutdown_timeout),
            max_concurrent_handlers: env_var(PREFIX, "MAX_CONCURRENT_HANDLERS")?
                .unwrap_or(defaults.max_concurrent_handlers),
            holder_status_timeout: secs("HOLDER_STATUS_TIMEOUT_SECS")?
                .unwrap_or(defaults.holder_status_timeout),
            issuance: EngineConfig::from_env_or("TRUSTHUB_ISSUANCE", defaults.issuance)?,
            holder_request: EngineConfig::from_env_or(
                "TRUSTHUB_HOLDER_REQUEST",
                defaults.holder_request,
            )?,
            status_list: EngineConfig::from_env_or("TRUSTHUB_STATUS_LIST", defaults.status_list)?,
        };

        if config.max_concurrent_handlers == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_handlers must be greater than zero",
            ));
        }
        Ok(config)
    }
}
