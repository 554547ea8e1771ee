//! Tracing setup and the per-kernel span.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::types::{KernelId, LogFormat, LoggingConfig, SessionId};

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Build the filter: `RUST_LOG` when set, else the configured level.
/// An unparsable level falls back to `info`.
fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Only the first call takes effect.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.get_or_init(|| {
        let filter = build_filter(config);
        let result = match config.format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_current_span(true))
                .try_init(),
            LogFormat::Text => tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact().with_target(false))
                .try_init(),
        };
        if let Err(err) = result {
            eprintln!("tracing init skipped: {err}");
        }
    });
}

/// Span carried by every kernel instance; its operations are instrumented with it.
pub fn kernel_span(kernel_id: &KernelId, session_id: &SessionId, backend: &'static str) -> tracing::Span {
    tracing::info_span!("kernel", kernel_id = %kernel_id, session_id = %session_id, backend = backend)
}
