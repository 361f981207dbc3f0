//! Error types raised by the sandbox filesystem supervisor.
//!
//! Each component reports its own error enum. [`SandboxError`] is the
//! build-level taxonomy the lifecycle controller surfaces, and it is the only
//! type the [`ErrorReporter`](crate::ErrorReporter) turns into diagnostics.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::process::ProcessState;

/// Errors raised while locating the sandbox filesystem executable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The explicitly configured executable cannot be run.
    #[error("'{}' is not usable as the sandbox filesystem executable: {reason}", path.display())]
    ExplicitPathUnusable {
        /// Path that was configured.
        path: PathBuf,
        /// Why the path was rejected.
        reason: String,
    },
    /// No search directory holds an executable with the program name.
    #[error("'{program}' was not found in any of {searched} search directories")]
    NotFound {
        /// Program name that was looked up.
        program: String,
        /// Number of directories inspected.
        searched: usize,
    },
}

/// Errors raised while allocating or reclaiming mount points.
#[derive(Debug, Clone, Error)]
pub enum MountError {
    /// The mount point directory could not be created.
    #[error("failed to create mount point '{}': {source}", path.display())]
    Allocate {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: Arc<io::Error>,
    },
    /// The mount point tree could not be removed.
    #[error("failed to remove mount point '{}': {source}", path.display())]
    Reclaim {
        /// Directory that could not be removed.
        path: PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: Arc<io::Error>,
    },
    /// Reclaim was requested while the owning process had not terminated.
    #[error("mount point '{}' is still served by process {pid} ({state})", path.display())]
    StillServed {
        /// Directory that was not removed.
        path: PathBuf,
        /// Process serving the mount.
        pid: u32,
        /// Observed process state.
        state: ProcessState,
    },
}

/// Errors raised by the line-oriented handshake channel.
#[derive(Debug, Clone, Error)]
pub enum HandshakeError {
    /// Writing a control line failed.
    #[error("failed to write to the sandbox process: {source}")]
    Write {
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
    /// Reading from the sandbox process failed.
    #[error("failed to read from the sandbox process: {source}")]
    Read {
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
    /// No line arrived before the deadline.
    #[error("no line received from the sandbox process within {timeout_ms} ms")]
    Timeout {
        /// Deadline that elapsed, in milliseconds.
        timeout_ms: u128,
    },
    /// The outbound side has already been closed.
    #[error("the sandbox process input is closed")]
    InputClosed,
    /// The background reader could not be started.
    #[error("failed to start the handshake reader: {source}")]
    Reader {
        /// Underlying thread spawn error.
        #[source]
        source: Arc<io::Error>,
    },
}

/// Errors raised while supervising a sandbox filesystem process.
#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    /// The executable could not be spawned.
    #[error("failed to start '{}': {source}", executable.display())]
    Spawn {
        /// Executable that failed to start.
        executable: PathBuf,
        /// Underlying OS error.
        #[source]
        source: Arc<io::Error>,
    },
    /// A standard stream of the child was not captured.
    #[error("the sandbox process {stream} pipe was not captured")]
    MissingPipe {
        /// Name of the missing stream.
        stream: &'static str,
    },
    /// The process did not announce readiness.
    #[error("sandbox process {pid} did not become ready: {source}")]
    NotReady {
        /// Process identifier.
        pid: u32,
        /// Handshake failure that prevented readiness.
        #[source]
        source: HandshakeError,
    },
    /// The process exited or closed its output without being asked to.
    #[error("sandbox process {pid} terminated unexpectedly ({status})")]
    UnexpectedTermination {
        /// Process identifier.
        pid: u32,
        /// Exit status as reported by the operating system.
        status: String,
    },
    /// Exchanging control lines failed.
    #[error("handshake with sandbox process {pid} failed: {source}")]
    Handshake {
        /// Process identifier.
        pid: u32,
        /// Underlying channel error.
        #[source]
        source: HandshakeError,
    },
    /// The process transitioned from a state that does not allow it.
    #[error("sandbox process {pid} cannot be activated while {state}")]
    InvalidState {
        /// Process identifier.
        pid: u32,
        /// Observed process state.
        state: ProcessState,
    },
}

impl SupervisorError {
    /// Returns `true` when the error reports that the process is gone.
    #[must_use]
    pub const fn is_termination(&self) -> bool {
        matches!(self, Self::UnexpectedTermination { .. })
    }
}

/// Failures that abort a build or are reported after it.
#[derive(Debug, Clone, Error)]
pub enum SandboxError {
    /// The executable could not be resolved.
    #[error(transparent)]
    ExecutableNotFound(#[from] ResolveError),
    /// The resolved executable failed to start or to become ready.
    #[error("failed to launch '{}': {source}", executable.display())]
    LaunchFailed {
        /// Executable that was launched.
        executable: PathBuf,
        /// Supervisor failure.
        #[source]
        source: SupervisorError,
    },
    /// A fresh mount point could not be created.
    #[error(transparent)]
    MountAllocationFailed(MountError),
    /// A mount point could not be removed after teardown.
    #[error(transparent)]
    MountReclaimFailed(MountError),
    /// The sandbox process died while serving a build.
    #[error(transparent)]
    UnexpectedTermination(SupervisorError),
    /// The sandbox process stopped answering the line protocol.
    #[error(transparent)]
    Handshake(SupervisorError),
}

impl SandboxError {
    /// Classifies a supervisor failure observed on a process that was already
    /// serving builds.
    #[must_use]
    pub fn from_running(error: SupervisorError) -> Self {
        if error.is_termination() {
            Self::UnexpectedTermination(error)
        } else {
            Self::Handshake(error)
        }
    }
}
