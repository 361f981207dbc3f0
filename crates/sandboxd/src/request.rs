//! JSON line protocol spoken on the server's stdin and stdout.
//!
//! Each input line is one [`BuildRequest`]. Each request produces exactly one
//! [`BuildReport`] line, including requests that fail to parse.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use sandboxfs_config::SandboxOptions;
use sandboxfs_supervisor::{BuildOutcome, SandboxSummary};

use crate::executor::{CommandOutcome, ExecutorError};

/// A build submitted to the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildRequest {
    /// Program and arguments to run.
    pub command: Vec<String>,
    /// Overrides whether the build runs inside a sandbox.
    #[serde(default)]
    pub use_sandboxfs: Option<bool>,
    /// Overrides debug retention for this build.
    #[serde(default)]
    pub sandbox_debug: Option<bool>,
    /// Overrides the explicit sandbox filesystem executable.
    #[serde(default)]
    pub sandboxfs_path: Option<PathBuf>,
}

/// Errors raised while decoding a request line.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The line was not a valid request object.
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The request named no program.
    #[error("request command is empty")]
    EmptyCommand,
}

impl BuildRequest {
    /// Creates a request that inherits every sandbox option.
    #[must_use]
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            use_sandboxfs: None,
            sandbox_debug: None,
            sandboxfs_path: None,
        }
    }

    /// Decodes one request line.
    pub fn parse(line: &str) -> Result<Self, RequestError> {
        let request: Self = serde_json::from_str(line)?;
        if request.command.is_empty() {
            return Err(RequestError::EmptyCommand);
        }
        Ok(request)
    }

    /// Layers the request's overrides over the server defaults.
    #[must_use]
    pub fn options(&self, defaults: &SandboxOptions) -> SandboxOptions {
        let mut options = defaults.clone();
        if let Some(enabled) = self.use_sandboxfs {
            options = options.with_enabled(enabled);
        }
        if let Some(debug) = self.sandbox_debug {
            options = options.with_debug(debug);
        }
        if let Some(path) = &self.sandboxfs_path {
            options = options.with_explicit_path(Some(path.clone()));
        }
        options
    }
}

/// The sandbox a reported build ran in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxReport {
    /// Process serving the mount.
    pub pid: u32,
    /// Mount point used as the build's working directory.
    pub mount_path: PathBuf,
    /// Whether the process was retained from an earlier build.
    pub reused: bool,
}

impl From<SandboxSummary> for SandboxReport {
    fn from(summary: SandboxSummary) -> Self {
        Self {
            pid: summary.pid,
            mount_path: summary.mount_path,
            reused: summary.reused,
        }
    }
}

/// Outcome of one request, written as a single JSON line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    /// Sequence number of the request, starting at 1.
    pub id: u64,
    /// Whether the command ran and exited successfully.
    pub success: bool,
    /// Exit code of the command, when it ran and exited normally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Sandbox the command ran in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxReport>,
    /// Single-line summary of the failure that aborted the build.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    /// Non-fatal sandbox problems observed during the build.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl BuildReport {
    /// Report for a line that could not be decoded.
    #[must_use]
    pub fn rejected(id: u64, error: &RequestError) -> Self {
        Self {
            id,
            success: false,
            exit_code: None,
            sandbox: None,
            diagnostic: Some(format!("Invalid build request: {error}")),
            warnings: Vec::new(),
        }
    }

    /// Report for a build the controller ran.
    #[must_use]
    pub fn from_outcome(
        id: u64,
        outcome: BuildOutcome<Result<CommandOutcome, ExecutorError>>,
    ) -> Self {
        let (success, exit_code, diagnostic) = match outcome.result {
            Ok(Ok(command)) => (command.success, command.exit_code, None),
            Ok(Err(error)) => (false, None, Some(format!("Build command failed: {error}"))),
            Err(diagnostic) => (false, None, Some(diagnostic.message().to_owned())),
        };
        Self {
            id,
            success,
            exit_code,
            sandbox: outcome.sandbox.map(SandboxReport::from),
            diagnostic,
            warnings: outcome.warnings.iter().map(ToString::to_string).collect(),
        }
    }
}
