//! The build server: one lifecycle controller fed by a request stream.
//!
//! All builds and the final teardown run on the thread that calls [`serve`].
//! Input lines and shutdown signals arrive from helper threads over a single
//! channel, so the controller itself is never shared.

mod events;

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use sandboxfs_config::Config;
use sandboxfs_supervisor::{ProcessSupervisor, SandboxLifecycleController, SandboxWarning};

use crate::executor::ActionExecutor;
use crate::health::HealthReporter;
use crate::request::{BuildReport, BuildRequest};
use crate::telemetry::TelemetryHandle;

pub use events::{ServeSummary, ServerError, serve};

const SERVER_TARGET: &str = "sandboxd::server";

/// Why the server stopped accepting requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The request stream reached end of file.
    InputClosed,
    /// A termination signal arrived.
    Signal,
    /// The loop ended with an error.
    Failed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InputClosed => "input_closed",
            Self::Signal => "signal",
            Self::Failed => "failed",
        })
    }
}

/// Result of a successful bootstrap: configuration plus the sandbox
/// controller the server drives.
pub struct BuildServer {
    config: Config,
    controller: SandboxLifecycleController<ProcessSupervisor>,
    telemetry: TelemetryHandle,
    reporter: Arc<dyn HealthReporter>,
    next_id: u64,
}

impl BuildServer {
    pub(crate) fn new(
        config: Config,
        controller: SandboxLifecycleController<ProcessSupervisor>,
        telemetry: TelemetryHandle,
        reporter: Arc<dyn HealthReporter>,
    ) -> Self {
        Self {
            config,
            controller,
            telemetry,
            reporter,
            next_id: 0,
        }
    }

    /// Accessor for the resolved configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Accessor for the telemetry handle, primarily useful for testing.
    #[must_use]
    pub const fn telemetry(&self) -> TelemetryHandle {
        self.telemetry
    }

    /// Process kept alive for debugging between builds, if any.
    #[must_use]
    pub fn retained_pid(&self) -> Option<u32> {
        self.controller.retained_pid()
    }

    /// Decodes and runs one request line.
    pub fn handle_line(&mut self, line: &str, executor: &dyn ActionExecutor) -> BuildReport {
        match BuildRequest::parse(line) {
            Ok(request) => self.run_build(&request, executor),
            Err(error) => {
                let report = BuildReport::rejected(self.allocate_id(), &error);
                self.reporter.build_finished(&report);
                report
            }
        }
    }

    /// Runs one build, sandboxed according to the request and configuration.
    ///
    /// The command runs against the mount point when the sandbox is enabled.
    /// The batch is closed with an acknowledgement afterwards so a sandbox that
    /// died during the command aborts the build.
    pub fn run_build(
        &mut self,
        request: &BuildRequest,
        executor: &dyn ActionExecutor,
    ) -> BuildReport {
        let id = self.allocate_id();
        let options = request.options(&self.config.build_options());
        self.reporter.build_started(id, &options);

        let outcome = self.controller.run_build(&options, |session| match session {
            Some(session) => {
                let result = executor.execute(&request.command, Some(session.mount_path()));
                if let Err(error) = session.sync() {
                    debug!(
                        target: SERVER_TARGET,
                        id,
                        error = %error,
                        "sandbox did not acknowledge the build"
                    );
                }
                result
            }
            None => executor.execute(&request.command, None),
        });

        for warning in &outcome.warnings {
            self.reporter.sandbox_warning(warning);
        }
        let report = BuildReport::from_outcome(id, outcome);
        self.reporter.build_finished(&report);
        report
    }

    /// Tears down any retained sandbox.
    pub fn shutdown(&mut self) -> Vec<SandboxWarning> {
        let warnings = self.controller.shutdown();
        for warning in &warnings {
            self.reporter.sandbox_warning(warning);
        }
        warnings
    }

    pub(crate) fn reporter(&self) -> &dyn HealthReporter {
        self.reporter.as_ref()
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id = self.next_id.saturating_add(1);
        self.next_id
    }
}
