//! Wires the production collaborators into a running build server.

use std::io::{self, BufRead, BufReader, Write};
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::bootstrap::{BootstrapError, ConfigLoader, SystemConfigLoader, bootstrap_with};
use crate::executor::{ActionExecutor, CommandExecutor};
use crate::health::{HealthReporter, StructuredHealthReporter};
use crate::server::{ServeSummary, ServerError, serve};
use crate::shutdown::{ShutdownSignal, SystemShutdownSignal};

const LAUNCH_TARGET: &str = "sandboxd::launch";

/// Errors surfaced while launching or running the build server.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Bootstrapping the server failed.
    #[error("build server bootstrap failed: {source}")]
    Bootstrap {
        /// Underlying bootstrap error.
        #[source]
        source: BootstrapError,
    },
    /// The request loop failed.
    #[error("build server failed: {source}")]
    Server {
        /// Underlying loop error.
        #[source]
        source: ServerError,
    },
}

impl From<BootstrapError> for LaunchError {
    fn from(source: BootstrapError) -> Self {
        Self::Bootstrap { source }
    }
}

impl From<ServerError> for LaunchError {
    fn from(source: ServerError) -> Self {
        Self::Server { source }
    }
}

/// Request stream, report sink, and stop signal for one server run.
pub struct ServerIo<R, W, S> {
    /// JSON line requests.
    pub input: R,
    /// JSON line reports.
    pub output: W,
    /// Termination signal source.
    pub signal: S,
}

/// Runs the build server on stdin and stdout until EOF or a signal.
pub fn run_server() -> Result<ServeSummary, LaunchError> {
    let streams = ServerIo {
        input: BufReader::new(io::stdin()),
        output: io::stdout(),
        signal: SystemShutdownSignal::new(),
    };
    run_server_with(
        &SystemConfigLoader,
        Arc::new(StructuredHealthReporter::new()),
        streams,
        &CommandExecutor::new(),
    )
}

/// Runs the build server with injected collaborators.
pub fn run_server_with<R, W, S>(
    loader: &dyn ConfigLoader,
    reporter: Arc<dyn HealthReporter>,
    streams: ServerIo<R, W, S>,
    executor: &dyn ActionExecutor,
) -> Result<ServeSummary, LaunchError>
where
    R: BufRead + Send + 'static,
    W: Write,
    S: ShutdownSignal + 'static,
{
    let server = bootstrap_with(loader, reporter)?;
    info!(
        target: LAUNCH_TARGET,
        sandbox = server.config().use_sandboxfs,
        "accepting build requests"
    );
    let summary = serve(
        server,
        streams.input,
        streams.output,
        streams.signal,
        executor,
    )?;
    info!(
        target: LAUNCH_TARGET,
        requests = summary.requests,
        reason = %summary.reason,
        "build server exited"
    );
    Ok(summary)
}
