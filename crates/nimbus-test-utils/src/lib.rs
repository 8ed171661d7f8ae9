//! Shared test utilities for nimbus tests.
//!
//! This crate provides:
//! - [`SimulatedClock`]: manually advanced wall clock for lock expiration
//! - [`SeededRandom`]: reproducible randomness
//! - [`ScriptedTxnKv`]: in-memory transactional store with operation recording
//!   and scripted store errors
//! - Factory functions for ids and bitmaps

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod fixtures;
pub mod kv;
pub mod simulation;

pub use fixtures::*;
pub use kv::*;
pub use simulation::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("nimbus=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
