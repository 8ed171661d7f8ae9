//! Meta-service configuration.
//!
//! Defaults suit production; every field can be overridden through a
//! `NIMBUS_*` environment variable.
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `NIMBUS_TXN_STORE_RETRY` | `retry.enabled` | `true` |
//! | `NIMBUS_TXN_STORE_RETRY_TIMES` | `retry.max_retries` | `20` |
//! | `NIMBUS_TXN_STORE_RETRY_BASE_INTERVAL_MS` | `retry.base_interval_ms` | `500` |
//! | `NIMBUS_RETRY_TXN_CONFLICT` | `retry.retry_txn_conflict` | `true` |
//! | `NIMBUS_DELETE_BITMAP_LOCK_V2_ALLOW_LIST` | `lock.v2_allow_list` | empty |
//! | `NIMBUS_DELETE_BITMAP_LOCK_EXPIRATION_SECS` | `lock.default_expiration_secs` | `10` |
//! | `NIMBUS_IDEMPOTENT_REPLAY_ENABLED` | `replay.enabled` | `false` |
//! | `NIMBUS_IDEMPOTENT_REPLAY_PROBABILITY` | `replay.probability` | `0.01` |
//! | `NIMBUS_IDEMPOTENT_REPLAY_DELAY_BASE_MS` | `replay.delay_base_ms` | `300` |
//! | `NIMBUS_IDEMPOTENT_REPLAY_DELAY_RANGE_MS` | `replay.delay_range_ms` | `200` |
//! | `NIMBUS_IDEMPOTENT_REPLAY_EXCLUSION` | `replay.exclusion` | empty |

use nimbus_core::env::EnvReader;
use serde::{Deserialize, Serialize};

use crate::error::{MetaError, Result};

/// Retry wrapper settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry transient store errors at all.
    pub enabled: bool,
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Backoff unit; attempt `n` sleeps `2^n * base + jitter`.
    pub base_interval_ms: u64,
    /// Treat `KV_TXN_CONFLICT` as retryable.
    pub retry_txn_conflict: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 20,
            base_interval_ms: 500,
            retry_txn_conflict: true,
        }
    }
}

/// Delete-bitmap lock settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// `;`-separated instance ids routed to the tablet-scoped protocol.
    pub v2_allow_list: String,
    /// Lease applied when a request does not carry one.
    pub default_expiration_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            v2_allow_list: String::new(),
            default_expiration_secs: 10,
        }
    }
}

/// Idempotent-replay injector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Replay at all.
    pub enabled: bool,
    /// Chance that a successful call is replayed, in `[0, 1]`.
    pub probability: f64,
    /// Mean delay before the replay.
    pub delay_base_ms: u64,
    /// The delay is drawn uniformly from `base ± range`.
    pub delay_range_ms: u64,
    /// Request names never replayed.
    pub exclusion: Vec<String>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            probability: 0.01,
            delay_base_ms: 300,
            delay_range_ms: 200,
            exclusion: Vec::new(),
        }
    }
}

impl ReplayConfig {
    /// Returns true if `method` is on the exclusion list.
    #[must_use]
    pub fn is_excluded(&self, method: &str) -> bool {
        self.exclusion.iter().any(|m| m == method)
    }
}

/// Configuration for the meta service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaServiceConfig {
    /// Retry wrapper.
    pub retry: RetryConfig,
    /// Lock protocol.
    pub lock: LockConfig,
    /// Replay injector.
    pub replay: ReplayConfig,
}

impl MetaServiceConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but malformed, or if the
    /// resulting configuration is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_reader(&EnvReader::process())
    }

    /// Loads configuration from an explicit variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but malformed, or if the
    /// resulting configuration is invalid.
    pub fn from_reader(env: &EnvReader<'_>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(enabled) = env.bool("NIMBUS_TXN_STORE_RETRY")? {
            config.retry.enabled = enabled;
        }
        if let Some(times) = env.u64("NIMBUS_TXN_STORE_RETRY_TIMES")? {
            config.retry.max_retries = u32::try_from(times).map_err(|_| {
                MetaError::InvalidArgument(format!(
                    "NIMBUS_TXN_STORE_RETRY_TIMES out of range: {times}"
                ))
            })?;
        }
        if let Some(ms) = env.u64("NIMBUS_TXN_STORE_RETRY_BASE_INTERVAL_MS")? {
            config.retry.base_interval_ms = ms;
        }
        if let Some(retry_conflict) = env.bool("NIMBUS_RETRY_TXN_CONFLICT")? {
            config.retry.retry_txn_conflict = retry_conflict;
        }

        if let Some(list) = env.string("NIMBUS_DELETE_BITMAP_LOCK_V2_ALLOW_LIST") {
            config.lock.v2_allow_list = list;
        }
        if let Some(secs) = env.u64("NIMBUS_DELETE_BITMAP_LOCK_EXPIRATION_SECS")? {
            config.lock.default_expiration_secs = secs;
        }

        if let Some(enabled) = env.bool("NIMBUS_IDEMPOTENT_REPLAY_ENABLED")? {
            config.replay.enabled = enabled;
        }
        if let Some(p) = env.f64("NIMBUS_IDEMPOTENT_REPLAY_PROBABILITY")? {
            config.replay.probability = p;
        }
        if let Some(ms) = env.u64("NIMBUS_IDEMPOTENT_REPLAY_DELAY_BASE_MS")? {
            config.replay.delay_base_ms = ms;
        }
        if let Some(ms) = env.u64("NIMBUS_IDEMPOTENT_REPLAY_DELAY_RANGE_MS")? {
            config.replay.delay_range_ms = ms;
        }
        if let Some(list) = env.string("NIMBUS_IDEMPOTENT_REPLAY_EXCLUSION") {
            config.replay.exclusion = parse_exclusion(&list);
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.retry.enabled && self.retry.base_interval_ms == 0 {
            return Err(MetaError::InvalidArgument(
                "NIMBUS_TXN_STORE_RETRY_BASE_INTERVAL_MS must be positive when retry is enabled"
                    .to_string(),
            ));
        }
        if self.lock.default_expiration_secs == 0 {
            return Err(MetaError::InvalidArgument(
                "NIMBUS_DELETE_BITMAP_LOCK_EXPIRATION_SECS must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.replay.probability) {
            return Err(MetaError::InvalidArgument(format!(
                "NIMBUS_IDEMPOTENT_REPLAY_PROBABILITY must be within [0, 1], got {}",
                self.replay.probability
            )));
        }
        Ok(())
    }
}

fn parse_exclusion(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = MetaServiceConfig::from_reader(&EnvReader::from_pairs(&[])).expect("config");
        assert_eq!(config, MetaServiceConfig::default());
        assert!(config.retry.enabled);
        assert_eq!(config.retry.max_retries, 20);
        assert!(!config.replay.enabled);
    }

    #[test]
    fn env_overrides_apply() {
        let env = EnvReader::from_pairs(&[
            ("NIMBUS_TXN_STORE_RETRY_TIMES", "5"),
            ("NIMBUS_RETRY_TXN_CONFLICT", "false"),
            ("NIMBUS_DELETE_BITMAP_LOCK_V2_ALLOW_LIST", "wh2;wh3"),
            ("NIMBUS_IDEMPOTENT_REPLAY_ENABLED", "1"),
            ("NIMBUS_IDEMPOTENT_REPLAY_EXCLUSION", "commit_txn, ,abort_txn"),
        ]);
        let config = MetaServiceConfig::from_reader(&env).expect("config");
        assert_eq!(config.retry.max_retries, 5);
        assert!(!config.retry.retry_txn_conflict);
        assert_eq!(config.lock.v2_allow_list, "wh2;wh3");
        assert!(config.replay.enabled);
        assert_eq!(config.replay.exclusion, vec!["commit_txn", "abort_txn"]);
        assert!(config.replay.is_excluded("abort_txn"));
    }

    #[test]
    fn out_of_range_probability_is_rejected() {
        let env = EnvReader::from_pairs(&[("NIMBUS_IDEMPOTENT_REPLAY_PROBABILITY", "1.5")]);
        let err = MetaServiceConfig::from_reader(&env).expect_err("invalid");
        assert!(err.to_string().contains("PROBABILITY"));
    }
}
