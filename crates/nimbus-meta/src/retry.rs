//! Transactional retry wrapper.
//!
//! Handlers run one store transaction per invocation and report transient
//! store failures as status codes. [`call_with_policy`] re-invokes the
//! handler from scratch while the code is retryable, sleeping with
//! exponential backoff in between, and maps the code to a distinct terminal
//! code once the budget is spent.
//!
//! | Code | Retried | Exhausted as |
//! |------|---------|--------------|
//! | `KV_TXN_STORE_GET_RETRYABLE` | yes | `KV_TXN_GET_ERR` |
//! | `KV_TXN_STORE_COMMIT_RETRYABLE` | yes | `KV_TXN_COMMIT_ERR` |
//! | `KV_TXN_STORE_CREATE_RETRYABLE` | yes | `KV_TXN_CREATE_ERR` |
//! | `KV_TXN_CONFLICT` | if configured | `KV_TXN_CONFLICT_RETRY_EXCEEDED_MAX_TIMES` |
//! | `KV_TXN_TOO_OLD` | once | `KV_TXN_TOO_OLD` |

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::MetaServiceCode;
use crate::metrics::MetaServiceMetrics;
use crate::rpc::MetaResponse;

/// Suspends the retry loop between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync + fmt::Debug {
    /// Sleeps for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Source of the per-call backoff jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Uniform over `[0, base_interval]`.
    #[default]
    Random,
    /// Always this many milliseconds.
    Fixed(u64),
}

/// When and how long to retry.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    enabled: bool,
    max_retries: u32,
    base_interval_ms: u64,
    retry_conflict: bool,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicy {
    /// Builds a policy from configuration, sleeping on the tokio timer.
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_retries: config.max_retries,
            base_interval_ms: config.base_interval_ms,
            retry_conflict: config.retry_txn_conflict,
            jitter: Jitter::Random,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Replaces the sleeper.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Replaces the jitter source.
    #[must_use]
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Maximum retries after the first attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns true if a response with `code` should be retried.
    #[must_use]
    pub fn is_retryable(&self, code: MetaServiceCode) -> bool {
        match code {
            MetaServiceCode::KvTxnStoreGetRetryable
            | MetaServiceCode::KvTxnStoreCommitRetryable
            | MetaServiceCode::KvTxnStoreCreateRetryable
            | MetaServiceCode::KvTxnTooOld => true,
            MetaServiceCode::KvTxnConflict => self.retry_conflict,
            _ => false,
        }
    }

    /// Delay before retry number `retry` (0-based): `2^retry * base + jitter`.
    #[must_use]
    pub fn backoff(&self, retry: u32, jitter_ms: u64) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        Duration::from_millis(
            factor
                .saturating_mul(self.base_interval_ms)
                .saturating_add(jitter_ms),
        )
    }

    fn draw_jitter(&self) -> u64 {
        match self.jitter {
            Jitter::Random => rand::thread_rng().gen_range(0..=self.base_interval_ms),
            Jitter::Fixed(ms) => ms,
        }
    }

    /// Returns true once no further retry is allowed after `retries` retries
    /// that ended with `code`.
    fn is_exhausted(&self, retries: u32, code: MetaServiceCode) -> bool {
        retries >= self.max_retries || (code == MetaServiceCode::KvTxnTooOld && retries >= 1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Invokes `attempt` until it returns a non-retryable status or the policy's
/// budget is spent.
///
/// Each invocation starts from a cleared response. With retry disabled the
/// handler runs once and the store-retryable codes are still mapped to
/// their terminal codes, so a raw `*_RETRYABLE` code never reaches the
/// caller.
pub async fn call_with_policy<Resp, F, Fut>(
    policy: &RetryPolicy,
    method: &'static str,
    metrics: &MetaServiceMetrics,
    mut attempt: F,
) -> Resp
where
    Resp: MetaResponse,
    F: FnMut() -> Fut,
    Fut: Future<Output = Resp>,
{
    if !policy.enabled {
        let mut resp = attempt().await;
        let code = resp.status().code;
        if matches!(
            code,
            MetaServiceCode::KvTxnStoreGetRetryable
                | MetaServiceCode::KvTxnStoreCommitRetryable
                | MetaServiceCode::KvTxnStoreCreateRetryable
        ) {
            resp.status_mut().code = code.exhausted();
        }
        return resp;
    }

    let mut retries = 0u32;
    let mut jitter_ms = 0u64;
    loop {
        let mut resp = attempt().await;
        let code = resp.status().code;
        if !policy.is_retryable(code) {
            return resp;
        }

        if policy.is_exhausted(retries, code) {
            let terminal = code.exhausted();
            metrics.record_retry_exhausted(method, terminal.as_str());
            warn!(
                method,
                retries,
                code = %code,
                terminal = %terminal,
                msg = %resp.status().msg,
                "transaction retries exhausted"
            );
            resp.status_mut().code = terminal;
            return resp;
        }

        if retries == 0 {
            jitter_ms = policy.draw_jitter();
        }
        let delay = policy.backoff(retries, jitter_ms);
        warn!(
            method,
            retry = retries + 1,
            retries_left = policy.max_retries - retries - 1,
            code = %code,
            msg = %resp.status().msg,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "retrying transaction"
        );
        metrics.record_retry(method, u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        drop(resp);
        policy.sleeper.sleep(delay).await;
        retries += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MetaStatus;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().expect("lock").push(duration);
        }
    }

    #[derive(Debug, Default)]
    struct Resp {
        status: MetaStatus,
        payload: Vec<u32>,
    }

    impl MetaResponse for Resp {
        fn status(&self) -> &MetaStatus {
            &self.status
        }

        fn status_mut(&mut self) -> &mut MetaStatus {
            &mut self.status
        }
    }

    fn policy(max_retries: u32, sleeper: &Arc<RecordingSleeper>) -> RetryPolicy {
        RetryPolicy::from_config(&RetryConfig {
            max_retries,
            base_interval_ms: 100,
            ..RetryConfig::default()
        })
        .with_jitter(Jitter::Fixed(7))
        .with_sleeper(sleeper.clone())
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let p = RetryPolicy::default().with_jitter(Jitter::Fixed(0));
        assert_eq!(p.backoff(0, 3), Duration::from_millis(503));
        assert_eq!(p.backoff(2, 0), Duration::from_millis(2000));
        assert_eq!(p.backoff(80, 0), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn conflict_retry_is_configurable() {
        let p = RetryPolicy::from_config(&RetryConfig {
            retry_txn_conflict: false,
            ..RetryConfig::default()
        });
        assert!(!p.is_retryable(MetaServiceCode::KvTxnConflict));
        assert!(p.is_retryable(MetaServiceCode::KvTxnTooOld));
        assert!(!p.is_retryable(MetaServiceCode::LockConflict));
        assert!(!p.is_retryable(MetaServiceCode::Ok));
    }

    #[tokio::test]
    async fn attempts_start_from_a_cleared_response() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let metrics = MetaServiceMetrics::new();
        let mut calls = 0u32;
        let resp: Resp = call_with_policy(&policy(5, &sleeper), "probe", &metrics, || {
            calls += 1;
            let n = calls;
            async move {
                let mut resp = Resp::default();
                resp.payload.push(n);
                if n == 1 {
                    resp.status.code = MetaServiceCode::KvTxnStoreGetRetryable;
                }
                resp
            }
        })
        .await;

        assert!(resp.status.is_ok());
        assert_eq!(resp.payload, vec![2]);
        assert_eq!(*sleeper.slept.lock().expect("lock"), vec![Duration::from_millis(107)]);
    }

    #[tokio::test]
    async fn business_errors_are_not_retried() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let metrics = MetaServiceMetrics::new();
        let resp: Resp = call_with_policy(&policy(5, &sleeper), "probe", &metrics, || async {
            Resp {
                status: MetaStatus::new(MetaServiceCode::LockConflict, "busy"),
                payload: Vec::new(),
            }
        })
        .await;
        assert_eq!(resp.status.code, MetaServiceCode::LockConflict);
        assert!(sleeper.slept.lock().expect("lock").is_empty());
        assert_eq!(metrics.snapshot().retries, 0);
    }
}
