//! Pipeline configuration loaded from environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `SITEGEN_MAX_CONCURRENT_JOBS` | `4` |
//! | `SITEGEN_GENERATION_TIMEOUT_SECS` | `300` |
//! | `SITEGEN_RETRY_MAX_ATTEMPTS` | `3` |
//! | `SITEGEN_RETRY_BASE_DELAY_MS` | `1000` |
//! | `SITEGEN_RETRY_MAX_DELAY_MS` | `4000` |
//! | `SITEGEN_RETRY_JITTER` | `0.0` |
//! | `SITEGEN_MAX_CONSECUTIVE_RESTORATIONS` | `2` |
//! | `SITEGEN_POLL_INTERVAL_MS` | `5000` (Postgres only) |
//! | `DATABASE_URL` | unset (in-memory stores) |
//! | `SITEGEN_BACKEND_URL` | unset |
//! | `SITEGEN_BACKEND_API_KEY` | unset |
//!
//! Values that do not parse fall back to the default with a warning.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::jobs::{BackoffStrategy, DispatcherConfig, RetryPolicy};
use crate::rollback::DEFAULT_MAX_CONSECUTIVE_RESTORATIONS;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub max_concurrent_jobs: usize,
    pub generation_timeout: Duration,
    pub retry: RetryPolicy,
    pub max_consecutive_restorations: u32,
    /// Interval for re-reading pending requests from a shared store.
    pub poll_interval: Duration,
    pub database_url: Option<String>,
    pub backend_url: Option<String>,
    pub backend_api_key: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            generation_timeout: Duration::from_secs(300),
            retry: RetryPolicy::reference(),
            max_consecutive_restorations: DEFAULT_MAX_CONSECUTIVE_RESTORATIONS,
            poll_interval: Duration::from_secs(5),
            database_url: None,
            backend_url: None,
            backend_api_key: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str, default| parse_or(&lookup, key, default);

        let max_concurrent_jobs = parse("SITEGEN_MAX_CONCURRENT_JOBS", 4u64);
        let max_concurrent_jobs = if max_concurrent_jobs == 0 {
            warn!("SITEGEN_MAX_CONCURRENT_JOBS is 0; using 1");
            1
        } else {
            max_concurrent_jobs as usize
        };

        let jitter = parse_or(&lookup, "SITEGEN_RETRY_JITTER", defaults.retry.jitter);
        let retry = RetryPolicy {
            max_attempts: parse("SITEGEN_RETRY_MAX_ATTEMPTS", 3).max(1) as u32,
            base_delay: Duration::from_millis(parse("SITEGEN_RETRY_BASE_DELAY_MS", 1000)),
            max_delay: Duration::from_millis(parse("SITEGEN_RETRY_MAX_DELAY_MS", 4000)),
            strategy: BackoffStrategy::Exponential,
            jitter: jitter.clamp(0.0, 1.0),
        };

        Self {
            max_concurrent_jobs,
            generation_timeout: Duration::from_secs(parse("SITEGEN_GENERATION_TIMEOUT_SECS", 300)),
            retry,
            max_consecutive_restorations: parse(
                "SITEGEN_MAX_CONSECUTIVE_RESTORATIONS",
                u64::from(DEFAULT_MAX_CONSECUTIVE_RESTORATIONS),
            ) as u32,
            poll_interval: Duration::from_millis(parse("SITEGEN_POLL_INTERVAL_MS", 5000).max(1)),
            database_url: non_empty(lookup("DATABASE_URL")),
            backend_url: non_empty(lookup("SITEGEN_BACKEND_URL")),
            backend_api_key: non_empty(lookup("SITEGEN_BACKEND_API_KEY")),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }

    /// Pool settings. Polling is enabled only with a database, where other
    /// processes can write pending requests this worker never hears about.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let config = DispatcherConfig::default().with_max_concurrent(self.max_concurrent_jobs);
        if self.database_url.is_some() {
            config.with_poll_interval(self.poll_interval)
        } else {
            config
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(err) => {
                warn!(key, value = %raw, error = %err, default = %default, "invalid config value; using default");
                default
            }
        },
        None => default,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
