//! Logging initialization and span helpers.
//!
//! All engine logging goes through `tracing`; spans carry the tenant,
//! pipeline and run so concurrent runs can be told apart.

use crate::config::{LogFormat, LoggingConfig};
use std::sync::Once;
use std::time::Instant;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over `config.level`. Subsequent calls are no-ops.
pub fn init_logging(config: &LoggingConfig) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.level));

        let result = match config.format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init(),
        };

        if let Err(e) = result {
            eprintln!("flowgate: logging already initialized: {e}");
        }
    });
}

/// Span for one pipeline run.
#[must_use]
pub fn run_span(tenant_id: &str, pipeline_id: &str, run_id: &str) -> Span {
    tracing::info_span!(
        "pipeline_run",
        tenant_id = tenant_id,
        pipeline_id = pipeline_id,
        run_id = run_id,
    )
}

/// Span for one step within a run.
#[must_use]
pub fn step_span(step_id: &str, step_type: &str) -> Span {
    tracing::info_span!("step", step_id = step_id, step_type = step_type)
}

/// Wall-clock timer for log fields.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
}

impl SpanTimer {
    /// Starts a new timer.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
