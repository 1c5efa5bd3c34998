// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler configuration.

use std::thread;
use std::time::Duration;

use crate::error::ConfigError;

/// Environment variable overriding the worker pool size.
pub const POOL_SIZE_ENV: &str = "SKEIN_MAX_POOL_SIZE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    pub pool_size: usize,
    /// Worker threads are named `{prefix}-{index}`.
    pub thread_name_prefix: String,
    /// How long an idle worker parks before rechecking for shutdown.
    pub idle_park: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4),
            thread_name_prefix: "skein-worker".to_string(),
            idle_park: Duration::from_millis(5),
        }
    }
}

impl SchedulerConfig {
    /// Defaults, with the pool size taken from `SKEIN_MAX_POOL_SIZE` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(POOL_SIZE_ENV) {
            config.pool_size = parse_pool_size(&raw)?;
            tracing::debug!(pool_size = config.pool_size, "pool size from environment");
        }
        Ok(config)
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn with_idle_park(mut self, idle_park: Duration) -> Self {
        self.idle_park = idle_park;
        self
    }
}

fn parse_pool_size(raw: &str) -> Result<usize, ConfigError> {
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => {
            tracing::warn!(value = raw, "rejecting invalid {}", POOL_SIZE_ENV);
            Err(ConfigError::InvalidPoolSize {
                value: raw.to_string(),
            })
        }
    }
}
