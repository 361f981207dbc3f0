//! Structured health reporting for build server lifecycle events.

use std::sync::Arc;

use sandboxfs_config::{Config, SandboxOptions};
use sandboxfs_supervisor::SandboxWarning;

use crate::bootstrap::BootstrapError;
use crate::request::BuildReport;
use crate::server::StopReason;

/// Observer trait used to surface lifecycle events to telemetry sinks.
pub trait HealthReporter: Send + Sync {
    /// Invoked before configuration loading begins.
    fn bootstrap_starting(&self);

    /// Invoked after bootstrap completes successfully.
    fn bootstrap_succeeded(&self, config: &Config);

    /// Invoked when bootstrap fails.
    fn bootstrap_failed(&self, error: &BootstrapError);

    /// Invoked when a build request has been decoded.
    fn build_started(&self, id: u64, options: &SandboxOptions);

    /// Invoked once the report for a request is known.
    fn build_finished(&self, report: &BuildReport);

    /// Invoked for each non-fatal sandbox problem.
    fn sandbox_warning(&self, warning: &SandboxWarning);

    /// Invoked when the server stops accepting requests.
    fn shutdown_starting(&self, reason: StopReason);

    /// Invoked after the sandbox has been torn down.
    fn shutdown_completed(&self);
}

impl<T> HealthReporter for Arc<T>
where
    T: HealthReporter,
{
    fn bootstrap_starting(&self) {
        (**self).bootstrap_starting();
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        (**self).bootstrap_succeeded(config);
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        (**self).bootstrap_failed(error);
    }

    fn build_started(&self, id: u64, options: &SandboxOptions) {
        (**self).build_started(id, options);
    }

    fn build_finished(&self, report: &BuildReport) {
        (**self).build_finished(report);
    }

    fn sandbox_warning(&self, warning: &SandboxWarning) {
        (**self).sandbox_warning(warning);
    }

    fn shutdown_starting(&self, reason: StopReason) {
        (**self).shutdown_starting(reason);
    }

    fn shutdown_completed(&self) {
        (**self).shutdown_completed();
    }
}

/// Default reporter that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredHealthReporter;

impl StructuredHealthReporter {
    /// Builds a new reporter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl HealthReporter for StructuredHealthReporter {
    fn bootstrap_starting(&self) {
        tracing::info!(
            target: "sandboxd::health",
            event = "bootstrap_starting",
            "starting build server bootstrap"
        );
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        tracing::info!(
            target: "sandboxd::health",
            event = "bootstrap_succeeded",
            use_sandboxfs = config.use_sandboxfs,
            sandbox_debug = config.sandbox_debug,
            program = config.program_name(),
            log_filter = %config.log_filter(),
            log_format = %config.log_format(),
            "build server bootstrap completed"
        );
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        tracing::error!(
            target: "sandboxd::health",
            event = "bootstrap_failed",
            error = %error,
            "build server bootstrap failed"
        );
    }

    fn build_started(&self, id: u64, options: &SandboxOptions) {
        tracing::info!(
            target: "sandboxd::health",
            event = "build_started",
            id,
            sandbox = options.enabled(),
            debug = options.debug(),
            "build started"
        );
    }

    fn build_finished(&self, report: &BuildReport) {
        let pid = report.sandbox.as_ref().map(|sandbox| sandbox.pid);
        let reused = report.sandbox.as_ref().is_some_and(|sandbox| sandbox.reused);
        tracing::info!(
            target: "sandboxd::health",
            event = "build_finished",
            id = report.id,
            success = report.success,
            exit_code = ?report.exit_code,
            sandbox_pid = ?pid,
            reused,
            diagnostic = ?report.diagnostic,
            "build finished"
        );
    }

    fn sandbox_warning(&self, warning: &SandboxWarning) {
        tracing::warn!(
            target: "sandboxd::health",
            event = "sandbox_warning",
            kind = warning.kind(),
            message = %warning,
            "sandbox warning"
        );
    }

    fn shutdown_starting(&self, reason: StopReason) {
        tracing::info!(
            target: "sandboxd::health",
            event = "shutdown_starting",
            reason = %reason,
            "build server shutting down"
        );
    }

    fn shutdown_completed(&self) {
        tracing::info!(
            target: "sandboxd::health",
            event = "shutdown_completed",
            "build server shutdown completed"
        );
    }
}
