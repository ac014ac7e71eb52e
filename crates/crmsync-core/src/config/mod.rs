//! Runtime settings for the sync layer, read from the environment

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::coordinator::ConflictPolicy;
use crate::queue::RetryPolicy;
use crate::util::{is_http_url, normalize_text_option};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Tuning knobs for the queue, workers, reconciler and read path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Number of queue workers
    pub worker_count: usize,
    /// Attempts before an event is dead-lettered
    pub max_attempts: u32,
    /// First retry delay
    pub backoff_base: Duration,
    /// Upper bound on a single retry delay
    pub backoff_cap: Duration,
    /// How long an idle worker sleeps before polling the queue again
    pub poll_interval: Duration,
    /// Period of the per-owner reconciliation cycle
    pub reconcile_interval: Duration,
    /// Bound on the on-demand fetch of the read path
    pub read_timeout: Duration,
    /// Age after which cached data is considered stale
    pub staleness: Duration,
    /// How conflicts are re-evaluated without an operator
    pub conflict_policy: ConflictPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
            reconcile_interval: Duration::from_secs(300),
            read_timeout: Duration::from_secs(3),
            staleness: Duration::from_secs(600),
            conflict_policy: ConflictPolicy::Manual,
        }
    }
}

impl SyncSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let worker_count = parse_in_range(&lookup, "SYNC_WORKER_COUNT", 4_usize, 1..=64)?;
        let max_attempts = parse_in_range(&lookup, "SYNC_MAX_ATTEMPTS", 5_u32, 1..=50)?;
        let backoff_base_ms =
            parse_in_range(&lookup, "SYNC_BACKOFF_BASE_MS", 1_000_u64, 10..=60_000)?;
        let backoff_cap_ms =
            parse_in_range(&lookup, "SYNC_BACKOFF_CAP_MS", 60_000_u64, 10..=3_600_000)?;
        if backoff_cap_ms < backoff_base_ms {
            return Err(ConfigError::Invalid(
                "SYNC_BACKOFF_CAP_MS must be >= SYNC_BACKOFF_BASE_MS".to_string(),
            ));
        }
        let poll_interval_ms =
            parse_in_range(&lookup, "SYNC_POLL_INTERVAL_MS", 250_u64, 10..=10_000)?;
        let reconcile_interval_secs =
            parse_in_range(&lookup, "SYNC_RECONCILE_INTERVAL_SECS", 300_u64, 5..=86_400)?;
        let read_timeout_ms =
            parse_in_range(&lookup, "SYNC_READ_TIMEOUT_MS", 3_000_u64, 100..=30_000)?;
        let staleness_secs = parse_in_range(&lookup, "SYNC_STALENESS_SECS", 600_u64, 10..=86_400)?;

        let conflict_policy = optional_trimmed(&lookup, "SYNC_CONFLICT_POLICY")
            .map(|value| value.parse::<ConflictPolicy>())
            .transpose()
            .map_err(|_| {
                ConfigError::Invalid(
                    "SYNC_CONFLICT_POLICY must be one of manual, local_wins, remote_wins"
                        .to_string(),
                )
            })?
            .unwrap_or_default();

        Ok(Self {
            worker_count,
            max_attempts,
            backoff_base: Duration::from_millis(backoff_base_ms),
            backoff_cap: Duration::from_millis(backoff_cap_ms),
            poll_interval: Duration::from_millis(poll_interval_ms),
            reconcile_interval: Duration::from_secs(reconcile_interval_secs),
            read_timeout: Duration::from_millis(read_timeout_ms),
            staleness: Duration::from_secs(staleness_secs),
            conflict_policy,
        })
    }

    /// Retry policy derived from these settings
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.backoff_base, self.backoff_cap)
    }
}

/// Connection details of the remote CRM
#[derive(Clone, PartialEq, Eq)]
pub struct CrmSettings {
    pub base_url: String,
    pub api_token: String,
    pub request_timeout: Duration,
}

impl fmt::Debug for CrmSettings {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("CrmSettings")
            .field("base_url", &self.base_url)
            .field("api_token", &"[REDACTED]")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl CrmSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base_url = required_trimmed(&lookup, "CRM_BASE_URL")?;
        if !is_http_url(&base_url) {
            return Err(ConfigError::Invalid(
                "CRM_BASE_URL must start with http:// or https://".to_string(),
            ));
        }
        let api_token = required_trimmed(&lookup, "CRM_API_TOKEN")?;
        let timeout_secs = parse_in_range(&lookup, "CRM_REQUEST_TIMEOUT_SECS", 10_u64, 1..=300)?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// Database location override from `CRMSYNC_DB_PATH`, if set
pub fn db_path_from_env() -> Option<PathBuf> {
    normalize_text_option(env::var("CRMSYNC_DB_PATH").ok()).map(PathBuf::from)
}

fn parse_in_range<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
    range: RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + fmt::Display + Copy,
{
    let invalid = || {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    };
    let value = match optional_trimmed(lookup, name) {
        Some(raw) => raw.parse::<T>().map_err(|_| invalid())?,
        None => default,
    };
    if !range.contains(&value) {
        return Err(invalid());
    }
    Ok(value)
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    normalize_text_option(lookup(name))
}
