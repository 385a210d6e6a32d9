//! Logging initialization and span helpers.
//!
//! Every worker pass runs inside a span carrying the component name and
//! worker instance, so interleaved output from concurrent instances stays
//! attributable.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Filter used when `RUST_LOG` is unset or invalid.
const DEFAULT_FILTER: &str = "info";

/// How worker logs are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event, including the current span's fields.
    Json,
    /// Multi-line human-readable output.
    #[default]
    Pretty,
}

/// Installs the global subscriber for a worker process.
///
/// Levels come from `RUST_LOG` (for example `recon_worker=debug`) and fall
/// back to `info`. Only the first call installs anything.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let registry = tracing_subscriber::registry().with(filter);
        match format {
            LogFormat::Json => registry
                .with(fmt::layer().json().with_current_span(true))
                .init(),
            LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
        }
    });
}

/// Creates the span for one pass of a worker task.
#[must_use]
pub fn task_span(task: &str, instance: usize) -> Span {
    tracing::info_span!("task", task = task, instance = instance)
}

/// Creates the span for work on one manifest.
#[must_use]
pub fn manifest_span(agent_id: &str, manifest_path: &str) -> Span {
    tracing::info_span!("manifest", agent = agent_id, manifest = manifest_path)
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
        let span = task_span("data_manifest_processor", 0);
        let _guard = span.enter();
        let inner = manifest_span("agent", "out/agent/DataFileManifest_1");
        let _inner = inner.enter();
        tracing::info!("message in spans");
    }
}
