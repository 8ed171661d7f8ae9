//! Observability infrastructure for nimbus.
//!
//! Structured logging with consistent spans. Meta-service handlers run
//! inside [`meta_span`]; delete-bitmap calculation tasks run inside
//! [`calc_span`] so a task failure can be traced back to its segment.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at process startup. Subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `nimbus_meta=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for one meta-service RPC.
///
/// # Example
///
/// ```rust
/// use nimbus_core::observability::meta_span;
///
/// let span = meta_span("get_delete_bitmap_update_lock", "warehouse-1");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn meta_span(method: &str, instance: &str) -> Span {
    tracing::info_span!("meta", method = method, instance = instance)
}

/// Creates a span for one delete-bitmap calculation task.
#[must_use]
pub fn calc_span(kind: &str, tablet: i64, rowset: &str, segment: u32) -> Span {
    tracing::info_span!(
        "calc_delete_bitmap",
        kind = kind,
        tablet = tablet,
        rowset = rowset,
        segment = segment,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn span_helpers_create_spans() {
        let span = meta_span("update_delete_bitmap", "wh1");
        let _guard = span.enter();
        let inner = calc_span("cross", 10, "r1", 0);
        let _inner = inner.enter();
        tracing::info!("inside calc span");
    }
}
