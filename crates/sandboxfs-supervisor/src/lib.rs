//! Supervision of the sandbox filesystem process used by the build server.
//!
//! A build server runs each build against an isolated view of the file tree
//! served by an external sandbox filesystem process. This crate owns that
//! process:
//!
//! - [`resolve()`] picks the executable, either an explicit path or the first
//!   match on the search path;
//! - [`MountPointManager`] allocates a fresh mount point per process and
//!   removes it after teardown;
//! - [`HandshakeChannel`] carries the line protocol over the child's
//!   stdin and stdout with bounded reads;
//! - [`ProcessSupervisor`] spawns [`SandboxProcess`] handles that always
//!   terminate, even when dropped;
//! - [`SandboxLifecycleController`] decides per build whether to reuse,
//!   restart, or launch, and tears down on every exit path unless debug
//!   retention is requested;
//! - [`ErrorReporter`] renders build-aborting failures as a single
//!   diagnostic line.

mod error;
mod handshake;
mod lifecycle;
mod mount;
mod process;
mod report;
mod resolve;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::{HandshakeError, MountError, ResolveError, SandboxError, SupervisorError};
pub use handshake::{HandshakeChannel, Inbound};
pub use lifecycle::{
    BuildOutcome, ControllerSettings, DEFAULT_SYNC_TIMEOUT, DEFAULT_TERMINATE_GRACE, Decision,
    RestartReason, SandboxLifecycleController, SandboxSession, SandboxSummary, decide,
};
pub use mount::{MountPointManager, MountRequest};
pub use process::{
    DEFAULT_DROP_GRACE, ProcessState, ProcessSupervisor, SandboxLauncher, SandboxProcess,
    SupervisedProcess, TerminationOutcome,
};
pub use report::{Diagnostic, DiagnosticKind, ErrorReporter, SandboxWarning};
pub use resolve::resolve;

#[cfg(test)]
mod tests;
