//! Tracing subscriber setup for the binaries.

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,kube=warn,sqlx=warn";

/// Raised when the subscriber cannot be installed.
#[derive(Debug, Error)]
#[error("failed to initialise logging: {message}")]
pub struct TelemetryError {
    /// Underlying failure.
    pub message: String,
}

/// Installs the global subscriber writing to stderr in `format`.
///
/// # Errors
///
/// Returns [`TelemetryError`] when `RUST_LOG` cannot be parsed or a global
/// subscriber is already installed.
pub fn init(format: LogFormat) -> Result<(), TelemetryError> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) => EnvFilter::try_new(directives),
        Err(_) => EnvFilter::try_new(DEFAULT_FILTER),
    }
    .map_err(|err| TelemetryError {
        message: err.to_string(),
    })?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let installed = match format {
        LogFormat::Text => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|err| TelemetryError {
        message: err.to_string(),
    })
}
