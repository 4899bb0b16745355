//! Tracing and logging infrastructure.
//!
//! Call [`setup_tracing`] once at startup. Console output is filtered by `RUST_LOG`
//! (defaulting to `info`).
//!
//! Without `pretty_logs`, output is plain text suitable for log aggregation:
//! ```text
//! INFO  log_relay::web::relay: Published 3 log entries [http_request{http.method=POST http.url=/}]
//! ```
//!
//! With `pretty_logs`, output is colorized with timestamps and span nesting:
//! ```text
//! 14:32:01.234 INFO  | log_relay::web::relay: Published 3 log entries
//! ```

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

#[cfg(feature = "pretty_logs")]
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(not(feature = "pretty_logs"))]
mod production;

#[cfg(feature = "pretty_logs")]
mod pretty;

const DEFAULT_LOG_FILTER: &str = "info";

/// Initializes the tracing subscriber with console output.
///
/// # Panics
///
/// Panics if called more than once (the global subscriber can only be set once).
pub fn setup_tracing() {
    Registry::default().with(setup_console_layer()).init();
    tracing::info!(
        "Tracing initialized for {} ({})",
        crate::APP_NAME.as_str(),
        crate::APP_VERSION.as_str()
    );
}

fn console_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

#[cfg(feature = "pretty_logs")]
fn setup_console_layer() -> Box<dyn Layer<Registry> + Send + Sync + 'static> {
    tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW)
        .event_format(pretty::PrettyConsoleLogFormat)
        .with_filter(console_filter())
        .boxed()
}

/// Creates the console output layer for production (no ANSI, with span context).
#[cfg(not(feature = "pretty_logs"))]
fn setup_console_layer() -> Box<dyn Layer<Registry> + Send + Sync + 'static> {
    tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .event_format(production::ProductionLogFormat)
        .with_filter(console_filter())
        .boxed()
}
