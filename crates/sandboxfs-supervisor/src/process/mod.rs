//! Ownership of the sandbox filesystem subprocess.
//!
//! [`ProcessSupervisor`] spawns the executable with the mount point as its
//! operative argument and wraps the child in a [`SandboxProcess`]. The
//! process handle is a scoped resource: whichever way it goes out of scope,
//! `Drop` sends SIGTERM, waits for a bounded grace period, and escalates to
//! SIGKILL.

use std::ffi::OsString;
use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

use crate::error::SupervisorError;
use crate::handshake::{HandshakeChannel, Inbound};

const PROCESS_TARGET: &str = "sandboxfs_supervisor::process";

/// Grace period used when a process handle is dropped without an explicit
/// termination.
pub const DEFAULT_DROP_GRACE: Duration = Duration::from_secs(5);

/// How long a process that closed its output is given to exit on its own.
const CRASH_REAP_GRACE: Duration = Duration::from_secs(1);

/// How long the kernel is given to reap a process after SIGKILL.
const KILL_REAP_GRACE: Duration = Duration::from_secs(2);

/// Acknowledgement written by the sandbox process after an input batch.
const BATCH_ACK: &str = "Done";

/// Lifecycle of a sandbox filesystem process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawned; readiness not yet confirmed.
    Starting,
    /// Serving the mount, not in use by a build.
    Ready,
    /// Serving the mount for the current build.
    Active,
    /// Termination requested; waiting for exit.
    Terminating,
    /// Exited and reaped.
    Terminated,
}

impl ProcessState {
    /// Whether the process serves its mount.
    #[must_use]
    pub const fn is_serving(self) -> bool {
        matches!(self, Self::Ready | Self::Active)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

/// How a termination request concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The process exited within the grace period.
    Graceful,
    /// The grace period elapsed and the process was killed.
    Forced,
    /// The process had already terminated; nothing was signalled.
    AlreadyTerminated,
    /// SIGKILL was sent but the process was not reaped in time. It may still
    /// hold its mount.
    Unreaped,
}

impl TerminationOutcome {
    /// Whether the grace period elapsed and SIGKILL was sent.
    #[must_use]
    pub const fn was_forced(self) -> bool {
        matches!(self, Self::Forced | Self::Unreaped)
    }
}

/// Result of a SIGKILL followed by a bounded wait.
enum Reap {
    Exited(ExitStatus),
    Unknown,
    Stuck,
}

impl Reap {
    const fn status(&self) -> Option<ExitStatus> {
        match self {
            Self::Exited(status) => Some(*status),
            Self::Unknown | Self::Stuck => None,
        }
    }
}

/// Operations the lifecycle controller needs from a supervised process.
pub trait SupervisedProcess {
    /// Operating system process identifier.
    fn pid(&self) -> u32;

    /// Mount point served by the process.
    fn mount_path(&self) -> &Path;

    /// Current lifecycle state.
    fn state(&self) -> ProcessState;

    /// Marks the mount as in use by the current build.
    fn activate(&mut self) -> Result<(), SupervisorError>;

    /// Returns an active process to `Ready` once its build has finished.
    fn release(&mut self);

    /// Ends an input batch and waits up to `timeout` for its acknowledgement.
    fn sync(&mut self, timeout: Duration) -> Result<(), SupervisorError>;

    /// Reports an unexpected exit if the process is no longer running.
    fn ensure_alive(&mut self) -> Result<(), SupervisorError>;

    /// Whether the process is still running.
    fn is_alive(&mut self) -> bool {
        self.ensure_alive().is_ok()
    }

    /// Stops the process: SIGTERM, then SIGKILL once `grace` elapses.
    ///
    /// Leaves the process `Terminated` once it has been reaped, after which
    /// calling it again has no effect. A process that outlives SIGKILL stays
    /// `Terminating` and reports [`TerminationOutcome::Unreaped`].
    fn terminate(&mut self, grace: Duration) -> TerminationOutcome;
}

/// Factory for supervised processes.
pub trait SandboxLauncher {
    /// Process type produced by the launcher.
    type Process: SupervisedProcess;

    /// Starts `executable` serving `mount_path`.
    fn launch(&self, executable: &Path, mount_path: &Path)
    -> Result<Self::Process, SupervisorError>;
}

/// Spawns sandbox filesystem processes.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    extra_args: Vec<OsString>,
    ready_timeout: Option<Duration>,
    drop_grace: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    /// Creates a supervisor that does not wait for a readiness line.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            extra_args: Vec::new(),
            ready_timeout: None,
            drop_grace: DEFAULT_DROP_GRACE,
        }
    }

    /// Waits up to `timeout` for the first output line after spawning.
    #[must_use]
    pub const fn with_ready_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Arguments placed before the mount point on the command line.
    #[must_use]
    pub fn with_extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Grace period applied when a process handle is dropped.
    #[must_use]
    pub const fn with_drop_grace(mut self, grace: Duration) -> Self {
        self.drop_grace = grace;
        self
    }
}

impl SandboxLauncher for ProcessSupervisor {
    type Process = SandboxProcess;

    fn launch(
        &self,
        executable: &Path,
        mount_path: &Path,
    ) -> Result<SandboxProcess, SupervisorError> {
        debug!(
            target: PROCESS_TARGET,
            executable = %executable.display(),
            mount = %mount_path.display(),
            args = ?self.extra_args,
            "spawning sandbox filesystem process"
        );

        let mut child = Command::new(executable)
            .args(&self.extra_args)
            .arg(mount_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                executable: executable.to_path_buf(),
                source: Arc::new(source),
            })?;
        let pid = child.id();

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            abandon(&mut child);
            return Err(SupervisorError::MissingPipe {
                stream: "stdio",
            });
        };
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(pid, stderr);
        }

        let channel = match HandshakeChannel::new(stdout, stdin) {
            Ok(channel) => channel,
            Err(source) => {
                abandon(&mut child);
                return Err(SupervisorError::Handshake { pid, source });
            }
        };

        let mut process = SandboxProcess {
            pid,
            mount_path: mount_path.to_path_buf(),
            state: ProcessState::Starting,
            child,
            channel,
            drop_grace: self.drop_grace,
        };

        if let Some(timeout) = self.ready_timeout {
            process.await_ready(timeout)?;
        }
        process.state = ProcessState::Ready;

        info!(
            target: PROCESS_TARGET,
            pid,
            mount = %process.mount_path.display(),
            "sandbox filesystem process ready"
        );
        Ok(process)
    }
}

/// A running sandbox filesystem subprocess and its handshake channel.
#[derive(Debug)]
pub struct SandboxProcess {
    pid: u32,
    mount_path: PathBuf,
    state: ProcessState,
    child: Child,
    channel: HandshakeChannel,
    drop_grace: Duration,
}

impl SandboxProcess {
    /// Writes a control line to the process.
    pub fn send_line(&mut self, text: &str) -> Result<(), SupervisorError> {
        self.ensure_alive()?;
        if let Err(source) = self.channel.send_line(text) {
            // A broken pipe usually means the process is exiting.
            if let Ok(Some(status)) = self.child.wait_timeout(CRASH_REAP_GRACE) {
                return Err(self.mark_exited(Some(status)));
            }
            return Err(SupervisorError::Handshake {
                pid: self.pid,
                source,
            });
        }
        Ok(())
    }

    /// Reads the next line written by the process.
    ///
    /// End-of-stream outside a termination request is a crash: the process is
    /// reaped, marked `Terminated`, and reported as
    /// [`SupervisorError::UnexpectedTermination`].
    pub fn read_line(&mut self, timeout: Duration) -> Result<String, SupervisorError> {
        match self.channel.read_line(timeout) {
            Ok(Inbound::Line(line)) => Ok(line),
            Ok(Inbound::EndOfStream) => Err(self.record_crash()),
            Err(source) => Err(SupervisorError::Handshake {
                pid: self.pid,
                source,
            }),
        }
    }

    fn await_ready(&mut self, timeout: Duration) -> Result<(), SupervisorError> {
        match self.channel.read_line(timeout) {
            Ok(Inbound::Line(line)) => {
                debug!(target: PROCESS_TARGET, pid = self.pid, line = %line, "readiness line received");
                Ok(())
            }
            Ok(Inbound::EndOfStream) => Err(self.record_crash()),
            Err(source) => Err(SupervisorError::NotReady {
                pid: self.pid,
                source,
            }),
        }
    }

    fn record_crash(&mut self) -> SupervisorError {
        let reap = match self.child.wait_timeout(CRASH_REAP_GRACE) {
            Ok(Some(status)) => Reap::Exited(status),
            Ok(None) | Err(_) => self.kill_and_reap(),
        };
        let error = self.mark_exited(reap.status());
        if matches!(reap, Reap::Stuck) {
            self.state = ProcessState::Terminating;
        }
        error
    }

    fn mark_exited(&mut self, status: Option<ExitStatus>) -> SupervisorError {
        self.state = ProcessState::Terminated;
        self.channel.close_input();
        let status = describe_status(status);
        warn!(
            target: PROCESS_TARGET,
            pid = self.pid,
            mount = %self.mount_path.display(),
            status = %status,
            "sandbox filesystem process terminated unexpectedly"
        );
        SupervisorError::UnexpectedTermination {
            pid: self.pid,
            status,
        }
    }

    fn signal_terminate(&self) {
        let Ok(raw) = i32::try_from(self.pid) else {
            return;
        };
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(error) => warn!(
                target: PROCESS_TARGET,
                pid = self.pid,
                error = %error,
                "failed to deliver SIGTERM"
            ),
        }
    }

    fn kill_and_reap(&mut self) -> Reap {
        if let Err(error) = self.child.kill() {
            debug!(target: PROCESS_TARGET, pid = self.pid, error = %error, "kill failed");
        }
        match self.child.wait_timeout(KILL_REAP_GRACE) {
            Ok(Some(status)) => Reap::Exited(status),
            Ok(None) => {
                warn!(
                    target: PROCESS_TARGET,
                    pid = self.pid,
                    waited_ms = KILL_REAP_GRACE.as_millis(),
                    "sandbox filesystem process was not reaped after SIGKILL"
                );
                Reap::Stuck
            }
            Err(error) => {
                warn!(
                    target: PROCESS_TARGET,
                    pid = self.pid,
                    error = %error,
                    "failed to reap sandbox filesystem process"
                );
                Reap::Unknown
            }
        }
    }

    fn await_exit(&mut self, grace: Duration) -> TerminationOutcome {
        let started = Instant::now();
        match self.child.wait_timeout(grace) {
            Ok(Some(status)) => {
                info!(
                    target: PROCESS_TARGET,
                    pid = self.pid,
                    status = %status,
                    elapsed_ms = started.elapsed().as_millis(),
                    "sandbox filesystem process exited"
                );
                TerminationOutcome::Graceful
            }
            Ok(None) => self.force_kill(grace),
            Err(error) => {
                warn!(
                    target: PROCESS_TARGET,
                    pid = self.pid,
                    error = %error,
                    "waiting for sandbox filesystem process failed"
                );
                self.force_kill(grace)
            }
        }
    }

    fn force_kill(&mut self, grace: Duration) -> TerminationOutcome {
        warn!(
            target: PROCESS_TARGET,
            event = "forced_termination",
            pid = self.pid,
            grace_ms = grace.as_millis(),
            "sandbox filesystem process ignored SIGTERM; sending SIGKILL"
        );
        let reap = self.kill_and_reap();
        if matches!(reap, Reap::Stuck) {
            return TerminationOutcome::Unreaped;
        }
        debug!(
            target: PROCESS_TARGET,
            pid = self.pid,
            status = %describe_status(reap.status()),
            "sandbox filesystem process killed"
        );
        TerminationOutcome::Forced
    }
}

impl SupervisedProcess for SandboxProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    fn state(&self) -> ProcessState {
        self.state
    }

    fn activate(&mut self) -> Result<(), SupervisorError> {
        self.ensure_alive()?;
        if !self.state.is_serving() {
            return Err(SupervisorError::InvalidState {
                pid: self.pid,
                state: self.state,
            });
        }
        self.state = ProcessState::Active;
        debug!(target: PROCESS_TARGET, pid = self.pid, "sandbox mount activated");
        Ok(())
    }

    fn release(&mut self) {
        if self.state == ProcessState::Active {
            self.state = ProcessState::Ready;
        }
    }

    fn sync(&mut self, timeout: Duration) -> Result<(), SupervisorError> {
        let deadline = Instant::now() + timeout;
        let stale = self.channel.discard_pending();
        if stale > 0 {
            debug!(
                target: PROCESS_TARGET,
                pid = self.pid,
                stale,
                "discarded lines left over from an earlier batch"
            );
        }
        self.send_line("")?;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = self.read_line(remaining)?;
            if line == BATCH_ACK {
                return Ok(());
            }
            debug!(
                target: PROCESS_TARGET,
                pid = self.pid,
                line = %line,
                "ignoring line while awaiting acknowledgement"
            );
        }
    }

    fn ensure_alive(&mut self) -> Result<(), SupervisorError> {
        if self.state == ProcessState::Terminated {
            return Err(SupervisorError::UnexpectedTermination {
                pid: self.pid,
                status: String::from("already terminated"),
            });
        }
        match self.child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(self.mark_exited(Some(status))),
            Err(error) => {
                warn!(
                    target: PROCESS_TARGET,
                    pid = self.pid,
                    error = %error,
                    "failed to poll sandbox filesystem process"
                );
                Ok(())
            }
        }
    }

    fn terminate(&mut self, grace: Duration) -> TerminationOutcome {
        if self.state == ProcessState::Terminated {
            return TerminationOutcome::AlreadyTerminated;
        }
        self.state = ProcessState::Terminating;
        info!(
            target: PROCESS_TARGET,
            pid = self.pid,
            mount = %self.mount_path.display(),
            grace_ms = grace.as_millis(),
            "terminating sandbox filesystem process"
        );

        let outcome = match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(target: PROCESS_TARGET, pid = self.pid, status = %status, "process had already exited");
                TerminationOutcome::Graceful
            }
            Ok(None) | Err(_) => {
                self.signal_terminate();
                self.await_exit(grace)
            }
        };

        self.channel.close_input();
        self.state = if outcome == TerminationOutcome::Unreaped {
            ProcessState::Terminating
        } else {
            ProcessState::Terminated
        };
        outcome
    }
}

impl Drop for SandboxProcess {
    fn drop(&mut self) {
        // `Terminating` here means SIGKILL was already sent and not reaped.
        if !matches!(
            self.state,
            ProcessState::Terminated | ProcessState::Terminating
        ) {
            let outcome = self.terminate(self.drop_grace);
            debug!(
                target: PROCESS_TARGET,
                pid = self.pid,
                outcome = ?outcome,
                "sandbox filesystem process released on drop"
            );
        }
    }
}

fn describe_status(status: Option<ExitStatus>) -> String {
    status.map_or_else(|| String::from("exit status unknown"), |status| status.to_string())
}

fn abandon(child: &mut Child) {
    if let Err(error) = child.kill() {
        debug!(target: PROCESS_TARGET, pid = child.id(), error = %error, "kill failed");
    }
    match child.wait_timeout(KILL_REAP_GRACE) {
        Ok(Some(_)) => {}
        Ok(None) => warn!(
            target: PROCESS_TARGET,
            pid = child.id(),
            "abandoned sandbox filesystem process was not reaped after SIGKILL"
        ),
        Err(error) => {
            debug!(target: PROCESS_TARGET, pid = child.id(), error = %error, "reap failed");
        }
    }
}

fn forward_stderr(pid: u32, stderr: ChildStderr) {
    let spawned = thread::Builder::new()
        .name(format!("sandboxfs-stderr-{pid}"))
        .spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                debug!(target: PROCESS_TARGET, pid, line = %line, "sandbox filesystem output");
            }
        });
    if let Err(error) = spawned {
        warn!(
            target: PROCESS_TARGET,
            pid,
            error = %error,
            "failed to forward sandbox filesystem stderr"
        );
    }
}
