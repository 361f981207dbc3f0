//! Runs build commands on behalf of the server.

use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::debug;

const EXECUTOR_TARGET: &str = "sandboxd::executor";

/// Environment variable naming the mount point a command runs against.
pub const MOUNT_ENV_VAR: &str = "SANDBOXFS_MOUNT";

/// How a build command finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Whether the command exited with status zero.
    pub success: bool,
    /// Exit code, absent when the command was killed by a signal.
    pub exit_code: Option<i32>,
}

/// Errors raised before a command could run to completion.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The command vector was empty.
    #[error("no program given")]
    EmptyCommand,
    /// The program could not be started.
    #[error("failed to run '{program}': {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Runs a build command, optionally inside a sandbox mount.
pub trait ActionExecutor: Send + Sync {
    /// Runs `command` and waits for it to finish.
    ///
    /// With a `mount_path` the command runs in that directory and sees it in
    /// [`MOUNT_ENV_VAR`]; otherwise it inherits the server's directory.
    fn execute(
        &self,
        command: &[String],
        mount_path: Option<&Path>,
    ) -> Result<CommandOutcome, ExecutorError>;
}

/// Executor that spawns the command as a child process.
///
/// Output is captured and logged so it never interleaves with the report
/// stream on stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandExecutor;

impl CommandExecutor {
    /// Builds a new executor.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ActionExecutor for CommandExecutor {
    fn execute(
        &self,
        command: &[String],
        mount_path: Option<&Path>,
    ) -> Result<CommandOutcome, ExecutorError> {
        let (program, args) = command.split_first().ok_or(ExecutorError::EmptyCommand)?;
        let mut child = Command::new(program);
        child.args(args).stdin(Stdio::null());
        if let Some(mount) = mount_path {
            child.current_dir(mount).env(MOUNT_ENV_VAR, mount);
        }

        let output = child.output().map_err(|source| ExecutorError::Spawn {
            program: program.clone(),
            source,
        })?;
        log_stream(program, "stdout", &output.stdout);
        log_stream(program, "stderr", &output.stderr);

        debug!(
            target: EXECUTOR_TARGET,
            program = %program,
            status = %output.status,
            "build command finished"
        );
        Ok(CommandOutcome {
            success: output.status.success(),
            exit_code: output.status.code(),
        })
    }
}

fn log_stream(program: &str, stream: &'static str, bytes: &[u8]) {
    for line in String::from_utf8_lossy(bytes).lines() {
        debug!(target: EXECUTOR_TARGET, program, stream, "{line}");
    }
}
