//! Deterministic time and randomness for simulation tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use nimbus_core::clock::Clock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Manually advanced wall clock.
///
/// Lock expiration is evaluated against this clock, so tests can expire a
/// lock by calling [`SimulatedClock::advance`] instead of sleeping.
#[derive(Debug)]
pub struct SimulatedClock {
    /// Base time (start of simulation).
    base: DateTime<Utc>,
    /// Elapsed milliseconds since base.
    elapsed_ms: AtomicU64,
}

impl SimulatedClock {
    /// Creates a new simulated clock starting at the given time.
    #[must_use]
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            elapsed_ms: AtomicU64::new(0),
        }
    }

    /// Creates a clock anchored at a fixed, deterministic instant.
    #[must_use]
    pub fn deterministic() -> Self {
        let base = Utc
            .timestamp_millis_opt(1_700_000_000_000)
            .single()
            .expect("valid timestamp");
        Self::new(base)
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        self.elapsed_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Returns elapsed time since simulation start.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms.load(Ordering::Relaxed))
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.elapsed_ms.load(Ordering::Relaxed);
        self.base + chrono::Duration::milliseconds(elapsed as i64)
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::deterministic()
    }
}

/// Seeded random source shared by a simulation.
///
/// The same seed produces the same sequence of decisions, so a failing
/// interleaving can be replayed.
#[derive(Debug)]
pub struct SeededRandom {
    seed: u64,
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    /// Creates a random source from a fixed seed.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Creates a random source from a random seed, printing it for reproduction.
    #[must_use]
    pub fn random() -> Self {
        let seed = rand::random();
        eprintln!("Simulation seed: {seed}");
        Self::with_seed(seed)
    }

    /// Returns the seed.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Returns true with the given probability.
    #[must_use]
    pub fn chance(&self, probability: f64) -> bool {
        if probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        self.rng.lock().expect("lock poisoned").r#gen::<f64>() < probability
    }

    /// Draws a value uniformly from `[low, high)`.
    #[must_use]
    pub fn range(&self, low: u64, high: u64) -> u64 {
        self.rng.lock().expect("lock poisoned").gen_range(low..high)
    }

    /// Returns a fresh `StdRng` derived from this source, for components that own their RNG.
    #[must_use]
    pub fn fork(&self) -> StdRng {
        let seed = self.rng.lock().expect("lock poisoned").r#gen::<u64>();
        StdRng::seed_from_u64(seed)
    }
}
