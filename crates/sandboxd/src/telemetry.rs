//! Log output for the build server.
//!
//! Stdout carries build reports, so every event is written to stderr. The
//! subscriber is process-global: the first configuration to arrive wins and
//! later ones reuse it.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing::{Subscriber, subscriber::SetGlobalDefaultError};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use sandboxfs_config::{Config, LogFormat};

static INSTALLED_FORMAT: OnceCell<LogFormat> = OnceCell::new();

/// Proof that the global subscriber is in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryHandle {
    format: LogFormat,
}

impl TelemetryHandle {
    /// Format of the installed subscriber, which may differ from the one
    /// requested by a later configuration.
    #[must_use]
    pub const fn format(self) -> LogFormat {
        self.format
    }
}

/// Failures while setting up log output.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// `log_filter` is not a valid `tracing` directive list.
    #[error("log filter '{directives}' is invalid: {reason}")]
    Filter {
        /// Directives as configured.
        directives: String,
        /// Parser message.
        reason: String,
    },
    /// Another subscriber was installed outside this module.
    #[error("a global log subscriber is already installed: {0}")]
    Subscriber(#[source] SetGlobalDefaultError),
}

/// Installs the stderr subscriber described by `config`, once per process.
pub fn initialise(config: &Config) -> Result<TelemetryHandle, TelemetryError> {
    INSTALLED_FORMAT
        .get_or_try_init(|| install(config))
        .map(|format| TelemetryHandle { format: *format })
}

fn install(config: &Config) -> Result<LogFormat, TelemetryError> {
    let subscriber = build_subscriber(config)?;
    tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)?;
    Ok(config.log_format())
}

fn build_subscriber(config: &Config) -> Result<Box<dyn Subscriber + Send + Sync>, TelemetryError> {
    let directives = config.log_filter();
    let filter = EnvFilter::try_new(directives).map_err(|error| TelemetryError::Filter {
        reason: error.to_string(),
        directives: directives.to_string(),
    })?;

    let stderr = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true);

    Ok(match config.log_format() {
        LogFormat::Json => Box::new(stderr.json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(stderr.compact().finish()),
    })
}
