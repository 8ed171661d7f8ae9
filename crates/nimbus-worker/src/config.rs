//! Worker configuration.
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `NIMBUS_CALC_DELETE_BITMAP_THREADS` | `calc_threads` | `8` |
//! | `NIMBUS_CALC_DELETE_BITMAP_MAX_TOKEN_CONCURRENCY` | `max_token_concurrency` | `calc_threads` |

use nimbus_core::env::EnvReader;
use serde::{Deserialize, Serialize};

use crate::error::{CalcError, Result};

/// Sizing of the calculation pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Tasks computing at once across every token.
    pub calc_threads: usize,
    /// Tasks of a single token computing at once.
    pub max_token_concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            calc_threads: 8,
            max_token_concurrency: 8,
        }
    }
}

impl WorkerConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `Config` if a variable is malformed or a size is zero.
    pub fn from_env() -> Result<Self> {
        Self::from_reader(&EnvReader::process())
    }

    /// Loads configuration from an explicit variable source.
    ///
    /// # Errors
    ///
    /// Returns `Config` if a variable is malformed or a size is zero.
    pub fn from_reader(env: &EnvReader<'_>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(threads) = env.usize("NIMBUS_CALC_DELETE_BITMAP_THREADS")? {
            config.calc_threads = threads;
            config.max_token_concurrency = threads;
        }
        if let Some(cap) = env.usize("NIMBUS_CALC_DELETE_BITMAP_MAX_TOKEN_CONCURRENCY")? {
            config.max_token_concurrency = cap;
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks that both sizes are positive.
    ///
    /// # Errors
    ///
    /// Returns `Config` naming the zero-sized setting.
    pub fn validate(&self) -> Result<()> {
        if self.calc_threads == 0 {
            return Err(CalcError::Config {
                message: "NIMBUS_CALC_DELETE_BITMAP_THREADS must be positive".to_string(),
            });
        }
        if self.max_token_concurrency == 0 {
            return Err(CalcError::Config {
                message: "NIMBUS_CALC_DELETE_BITMAP_MAX_TOKEN_CONCURRENCY must be positive"
                    .to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_cap_follows_pool_size_unless_set() {
        let env = EnvReader::from_pairs(&[("NIMBUS_CALC_DELETE_BITMAP_THREADS", "4")]);
        let config = WorkerConfig::from_reader(&env).expect("config");
        assert_eq!(config.calc_threads, 4);
        assert_eq!(config.max_token_concurrency, 4);

        let env = EnvReader::from_pairs(&[
            ("NIMBUS_CALC_DELETE_BITMAP_THREADS", "4"),
            ("NIMBUS_CALC_DELETE_BITMAP_MAX_TOKEN_CONCURRENCY", "1"),
        ]);
        assert_eq!(
            WorkerConfig::from_reader(&env).expect("config").max_token_concurrency,
            1
        );
    }

    #[test]
    fn zero_or_malformed_sizes_are_rejected() {
        for value in ["0", "eight"] {
            let env = EnvReader::from_pairs(&[("NIMBUS_CALC_DELETE_BITMAP_THREADS", value)]);
            assert!(matches!(
                WorkerConfig::from_reader(&env),
                Err(CalcError::Config { .. })
            ));
        }
    }
}
