//! Build-facing diagnostics and post-build warnings.

use std::fmt;
use std::time::Duration;

use tracing::{error, warn};

use crate::error::{MountError, SandboxError, SupervisorError};

const REPORT_TARGET: &str = "sandboxfs_supervisor::report";

/// Category of a build-aborting sandbox failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// The executable could not be resolved.
    ExecutableNotFound,
    /// The executable could not be started or did not become ready.
    LaunchFailed,
    /// No mount point could be created.
    MountAllocationFailed,
    /// A mount point could not be removed.
    MountReclaimFailed,
    /// The sandbox process died while serving the build.
    UnexpectedTermination,
    /// The sandbox process stopped answering.
    Handshake,
}

impl DiagnosticKind {
    /// Stable identifier used in structured output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExecutableNotFound => "executable_not_found",
            Self::LaunchFailed => "launch_failed",
            Self::MountAllocationFailed => "mount_allocation_failed",
            Self::MountReclaimFailed => "mount_reclaim_failed",
            Self::UnexpectedTermination => "unexpected_termination",
            Self::Handshake => "handshake",
        }
    }
}

/// One formatted line describing why a build could not use its sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    kind: DiagnosticKind,
    message: String,
}

impl Diagnostic {
    /// Failure category.
    #[must_use]
    pub const fn kind(&self) -> DiagnosticKind {
        self.kind
    }

    /// Rendered diagnostic line.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Turns sandbox failures into the single diagnostic attached to a build.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorReporter;

impl ErrorReporter {
    /// Builds a reporter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Renders `error` without logging it.
    #[must_use]
    pub fn diagnose(&self, error: &SandboxError) -> Diagnostic {
        let (kind, message) = match error {
            SandboxError::ExecutableNotFound(_) => (
                DiagnosticKind::ExecutableNotFound,
                format!("Failed to initialize sandbox: {error}"),
            ),
            SandboxError::LaunchFailed { .. } => (
                DiagnosticKind::LaunchFailed,
                format!("Failed to initialize sandbox: {error}"),
            ),
            SandboxError::MountAllocationFailed(_) => (
                DiagnosticKind::MountAllocationFailed,
                format!("Failed to initialize sandbox: {error}"),
            ),
            SandboxError::MountReclaimFailed(_) => (
                DiagnosticKind::MountReclaimFailed,
                format!("Failed to clean up sandbox: {error}"),
            ),
            SandboxError::UnexpectedTermination(_) => (
                DiagnosticKind::UnexpectedTermination,
                format!("Sandbox filesystem failed during the build: {error}"),
            ),
            SandboxError::Handshake(_) => (
                DiagnosticKind::Handshake,
                format!("Sandbox filesystem stopped responding: {error}"),
            ),
        };
        Diagnostic { kind, message }
    }

    /// Renders `error` and logs it once.
    pub fn report(&self, error: &SandboxError) -> Diagnostic {
        let diagnostic = self.diagnose(error);
        error!(
            target: REPORT_TARGET,
            kind = diagnostic.kind.as_str(),
            error = ?error,
            "{}",
            diagnostic.message
        );
        diagnostic
    }

    /// Logs a non-fatal post-build warning.
    pub fn warn(&self, warning: &SandboxWarning) {
        warn!(
            target: REPORT_TARGET,
            kind = warning.kind(),
            "{warning}"
        );
    }
}

/// A problem observed during teardown or reuse that does not fail the build.
#[derive(Debug, Clone)]
pub enum SandboxWarning {
    /// The process ignored SIGTERM and was killed.
    ForcedTermination {
        /// Process identifier.
        pid: u32,
        /// Grace period that elapsed.
        grace: Duration,
    },
    /// The mount point could not be removed after teardown.
    ReclaimFailed {
        /// Underlying mount failure.
        error: MountError,
    },
    /// A process retained for debugging had died before it could be reused.
    RetainedProcessLost {
        /// Liveness failure observed.
        error: SupervisorError,
    },
}

impl SandboxWarning {
    /// Stable identifier used in structured output.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ForcedTermination { .. } => "forced_termination",
            Self::ReclaimFailed { .. } => "mount_reclaim_failed",
            Self::RetainedProcessLost { .. } => "retained_process_lost",
        }
    }
}

impl fmt::Display for SandboxWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForcedTermination { pid, grace } => write!(
                f,
                "sandbox process {pid} ignored SIGTERM for {} ms and was killed",
                grace.as_millis()
            ),
            Self::ReclaimFailed { error } => write!(f, "{}", SandboxError::MountReclaimFailed(error.clone())),
            Self::RetainedProcessLost { error } => {
                write!(f, "retained sandbox was lost and will be relaunched: {error}")
            }
        }
    }
}
