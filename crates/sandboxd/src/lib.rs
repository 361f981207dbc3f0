//! The sandboxfs build server.
//!
//! `sandboxd` reads build requests as JSON lines on stdin, runs each command
//! inside a sandbox filesystem mount managed by [`sandboxfs_supervisor`], and
//! writes one JSON report line per request on stdout. Configuration comes
//! from [`sandboxfs_config`]; logs go to stderr through `tracing`.
//!
//! The server owns a single lifecycle controller. A sandbox launched for one
//! build is kept for the next only while debug retention is on, and is torn
//! down when the request stream closes or a termination signal arrives.

mod bootstrap;
mod executor;
mod health;
mod launch;
mod request;
mod server;
mod shutdown;
mod telemetry;

pub use bootstrap::{
    BootstrapError, ConfigLoader, StaticConfigLoader, SystemConfigLoader, bootstrap_with,
};
pub use executor::{ActionExecutor, CommandExecutor, CommandOutcome, ExecutorError, MOUNT_ENV_VAR};
pub use health::{HealthReporter, StructuredHealthReporter};
pub use launch::{LaunchError, ServerIo, run_server, run_server_with};
pub use request::{BuildReport, BuildRequest, RequestError, SandboxReport};
pub use server::{BuildServer, ServeSummary, ServerError, StopReason, serve};
pub use shutdown::{ShutdownError, ShutdownSignal, SystemShutdownSignal};
pub use telemetry::{TelemetryError, TelemetryHandle};

#[cfg(test)]
mod tests;
