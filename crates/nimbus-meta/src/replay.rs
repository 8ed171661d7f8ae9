//! Idempotent-replay injector.
//!
//! A chaos aid: after a successful call, the injector occasionally schedules
//! a detached replay of a copy of the same request against the raw handler.
//! The replay's response is dropped. If a handler is not idempotent the
//! replay shows up as a state change that tests can observe.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ReplayConfig;
use crate::metrics::MetaServiceMetrics;
use crate::rpc::{MetaRequest, MetaResponse};

/// Schedules replays of successful requests.
#[derive(Debug)]
pub struct IdempotentReplayInjector {
    config: ReplayConfig,
    rng: Mutex<StdRng>,
    metrics: Arc<MetaServiceMetrics>,
}

impl IdempotentReplayInjector {
    /// Creates an injector with an entropy-seeded generator.
    #[must_use]
    pub fn new(config: ReplayConfig, metrics: Arc<MetaServiceMetrics>) -> Self {
        Self::with_rng(config, StdRng::from_entropy(), metrics)
    }

    /// Creates an injector drawing from `rng`.
    #[must_use]
    pub fn with_rng(config: ReplayConfig, rng: StdRng, metrics: Arc<MetaServiceMetrics>) -> Self {
        Self {
            config,
            rng: Mutex::new(rng),
            metrics,
        }
    }

    /// Replay settings.
    #[must_use]
    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    /// Possibly schedules a replay of `req` after a successful `resp`.
    ///
    /// `handler` is the raw handler, not the retry wrapper. Returns the
    /// replay task when one was scheduled; callers are free to drop it.
    pub fn maybe_replay<Req, Resp, F, Fut>(
        &self,
        req: &Req,
        resp: &Resp,
        handler: F,
    ) -> Option<JoinHandle<()>>
    where
        Req: MetaRequest,
        Resp: MetaResponse,
        F: FnOnce(Req) -> Fut + Send + 'static,
        Fut: Future<Output = Resp> + Send + 'static,
    {
        if !self.config.enabled || !resp.status().is_ok() || self.config.is_excluded(Req::NAME) {
            return None;
        }

        let delay_ms = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            let probability = self.config.probability;
            if probability.is_nan() || probability <= 0.0 {
                return None;
            }
            if !rng.gen_bool(probability.min(1.0)) {
                return None;
            }
            let range = i64::try_from(self.config.delay_range_ms).unwrap_or(i64::MAX);
            let base = i64::try_from(self.config.delay_base_ms).unwrap_or(i64::MAX);
            base.saturating_add(rng.gen_range(-range..=range))
        };
        let Ok(delay_ms) = u64::try_from(delay_ms) else {
            debug!(method = Req::NAME, delay_ms, "skipping replay with negative delay");
            return None;
        };

        self.metrics.record_replay(Req::NAME);
        info!(
            method = Req::NAME,
            instance = req.instance_id(),
            delay_ms,
            "scheduling idempotent replay"
        );

        let copy = req.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let resp = handler(copy).await;
            debug!(
                method = Req::NAME,
                code = %resp.status().code,
                "idempotent replay finished"
            );
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MetaServiceCode, MetaStatus};
    use crate::rpc::{UpdateDeleteBitmapRequest, UpdateDeleteBitmapResponse};
    use nimbus_test_utils::SeededRandom;

    fn always() -> ReplayConfig {
        ReplayConfig {
            enabled: true,
            probability: 1.0,
            delay_base_ms: 10,
            delay_range_ms: 5,
            exclusion: Vec::new(),
        }
    }

    fn injector(config: ReplayConfig) -> IdempotentReplayInjector {
        IdempotentReplayInjector::with_rng(
            config,
            SeededRandom::with_seed(7).fork(),
            Arc::new(MetaServiceMetrics::new()),
        )
    }

    async fn ok_handler(_: UpdateDeleteBitmapRequest) -> UpdateDeleteBitmapResponse {
        UpdateDeleteBitmapResponse::default()
    }

    #[tokio::test(start_paused = true)]
    async fn replays_successful_requests() {
        let injector = injector(always());
        let handle = injector
            .maybe_replay(
                &UpdateDeleteBitmapRequest::default(),
                &UpdateDeleteBitmapResponse::default(),
                ok_handler,
            )
            .expect("replay scheduled");
        handle.await.expect("replay task");
        assert_eq!(injector.metrics.snapshot().replays_scheduled, 1);
    }

    #[tokio::test]
    async fn skips_failures_exclusions_and_negative_delays() {
        let failed = UpdateDeleteBitmapResponse {
            status: MetaStatus::new(MetaServiceCode::LockExpired, "gone"),
        };
        let req = UpdateDeleteBitmapRequest::default();

        assert!(injector(always()).maybe_replay(&req, &failed, ok_handler).is_none());

        let excluded = ReplayConfig {
            exclusion: vec![UpdateDeleteBitmapRequest::NAME.to_string()],
            ..always()
        };
        let ok = UpdateDeleteBitmapResponse::default();
        assert!(injector(excluded).maybe_replay(&req, &ok, ok_handler).is_none());

        let centered_on_zero = injector(ReplayConfig {
            delay_base_ms: 0,
            delay_range_ms: 1_000,
            ..always()
        });
        let scheduled = (0..64)
            .filter_map(|_| centered_on_zero.maybe_replay(&req, &ok, ok_handler))
            .count();
        assert!(scheduled > 0 && scheduled < 64, "scheduled {scheduled} of 64");
        assert_eq!(
            centered_on_zero.metrics.snapshot().replays_scheduled,
            scheduled as u64
        );

        let never = ReplayConfig {
            probability: 0.0,
            ..always()
        };
        assert!(injector(never).maybe_replay(&req, &ok, ok_handler).is_none());
    }

    #[test]
    fn unusable_probabilities_never_replay() {
        let req = UpdateDeleteBitmapRequest::default();
        let ok = UpdateDeleteBitmapResponse::default();
        for probability in [f64::NAN, -0.5] {
            let injector = injector(ReplayConfig {
                probability,
                ..always()
            });
            assert!(injector.maybe_replay(&req, &ok, ok_handler).is_none());
            assert_eq!(injector.metrics.snapshot().replays_scheduled, 0);
        }
    }
}
