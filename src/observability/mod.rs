//! Logging and operation metrics.
//!
//! Library code only emits `tracing` events and `metrics` samples; nothing is
//! installed unless the application calls [`init_logging`] or installs its
//! own subscriber and recorder.

use crate::{Error, Result};
use std::sync::OnceLock;
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Counter of engine and store operations, labelled by operation and status.
pub const OPERATIONS_TOTAL: &str = "embedstore_operations_total";
/// Histogram of operation latency in milliseconds.
pub const OPERATION_DURATION_MS: &str = "embedstore_operation_duration_ms";

static LOGGING_INIT: OnceLock<()> = OnceLock::new();

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Parses a format name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Logging configuration.
#[derive(Debug)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// Event filter.
    pub filter: EnvFilter,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            filter: EnvFilter::new("embedstore=info"),
        }
    }
}

impl LoggingConfig {
    /// Builds logging configuration from the environment.
    ///
    /// `RUST_LOG` sets the filter (default `embedstore=info`) and
    /// `EMBEDSTORE_LOG_FORMAT` the format (`pretty` or `json`).
    #[must_use]
    pub fn from_env() -> Self {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("embedstore=info"));
        let format = std::env::var("EMBEDSTORE_LOG_FORMAT")
            .ok()
            .and_then(|v| LogFormat::parse(&v))
            .unwrap_or_default();
        Self { format, filter }
    }

    /// Sets the format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets the filter directives, e.g. `embedstore=debug,tokio_postgres=warn`.
    #[must_use]
    pub fn with_directives(mut self, directives: &str) -> Self {
        self.filter = EnvFilter::new(directives);
        self
    }
}

/// Installs the global `tracing` subscriber.
///
/// # Errors
///
/// Returns an error if logging was already initialized by this function or
/// if another global subscriber is installed.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    if LOGGING_INIT.get().is_some() {
        return Err(Error::OperationFailed {
            operation: "logging_init".to_string(),
            cause: "logging already initialized".to_string(),
        });
    }

    match config.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_span_list(true)
                        .with_target(true),
                )
                .with(config.filter)
                .try_init()
                .map_err(init_error)?;
        },
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_target(true)
                        .with_thread_ids(true),
                )
                .with(config.filter)
                .try_init()
                .map_err(init_error)?;
        },
    }

    LOGGING_INIT.set(()).map_err(|()| Error::OperationFailed {
        operation: "logging_init".to_string(),
        cause: "failed to mark logging initialized".to_string(),
    })
}

#[allow(clippy::needless_pass_by_value)]
fn init_error(e: tracing_subscriber::util::TryInitError) -> Error {
    Error::OperationFailed {
        operation: "logging_init".to_string(),
        cause: e.to_string(),
    }
}

/// Records the outcome and latency of one operation.
pub(crate) fn record_operation<T>(operation: &'static str, started: Instant, result: &Result<T>) {
    let status = match result {
        Ok(_) => "success",
        Err(Error::Connectivity { .. }) => "connectivity_error",
        Err(_) => "error",
    };
    metrics::counter!(OPERATIONS_TOTAL, "operation" => operation, "status" => status).increment(1);
    metrics::histogram!(OPERATION_DURATION_MS, "operation" => operation)
        .record(started.elapsed().as_secs_f64() * 1000.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("text"), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn test_default_config() {
        let config = LoggingConfig::default().with_format(LogFormat::Json);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.filter.to_string(), "embedstore=info");
    }

    #[test]
    fn test_record_operation_without_recorder() {
        let ok: Result<()> = Ok(());
        record_operation("search", Instant::now(), &ok);
        let err: Result<()> = Err(Error::Configuration("x".to_string()));
        record_operation("search", Instant::now(), &err);
    }
}
