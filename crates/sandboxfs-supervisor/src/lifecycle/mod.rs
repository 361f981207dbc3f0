//! Sandbox lifecycle across builds.
//!
//! The controller owns at most one sandbox process. At the start of every
//! build it compares the build's [`SandboxOptions`] with those of the build
//! that left a process behind and either reuses that process, restarts it,
//! or launches a fresh one. At the end of the build the process is retained
//! only when debug retention is requested; otherwise it is terminated and its
//! mount point reclaimed. Shutdown always tears down.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sandboxfs_config::{Config, DEFAULT_PROGRAM_NAME, SandboxOptions};
use tracing::{debug, info, warn};

use crate::error::{MountError, SandboxError, SupervisorError};
use crate::mount::MountPointManager;
use crate::process::{ProcessState, SandboxLauncher, SupervisedProcess};
use crate::report::{Diagnostic, ErrorReporter, SandboxWarning};
use crate::resolve::resolve;

const LIFECYCLE_TARGET: &str = "sandboxfs_supervisor::lifecycle";

/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Default deadline for a batch acknowledgement.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a retained sandbox is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// Debug retention changed between builds.
    DebugToggled,
    /// The explicit executable changed between builds.
    ExecutableChanged,
    /// The previous build did not ask for retention.
    NotRetained,
}

/// What the controller does with the sandbox when a build starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The build runs without a sandbox; any retained one is torn down.
    Disabled,
    /// No sandbox exists; launch one.
    Launch,
    /// Keep using the retained sandbox.
    Reuse,
    /// Tear the retained sandbox down and launch a fresh one.
    Restart(RestartReason),
}

/// Chooses how a build obtains its sandbox.
///
/// `prior` holds the options of the build that retained the current process,
/// if any process was retained.
#[must_use]
pub fn decide(prior: Option<&SandboxOptions>, current: &SandboxOptions) -> Decision {
    if !current.enabled() {
        return Decision::Disabled;
    }
    let Some(prior) = prior else {
        return Decision::Launch;
    };
    if prior.explicit_path() != current.explicit_path() {
        return Decision::Restart(RestartReason::ExecutableChanged);
    }
    match (prior.debug(), current.debug()) {
        (true, true) => Decision::Reuse,
        (true, false) | (false, true) => Decision::Restart(RestartReason::DebugToggled),
        (false, false) => Decision::Restart(RestartReason::NotRetained),
    }
}

/// Settings the controller applies to every build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    program_name: String,
    search_dirs: Vec<PathBuf>,
    terminate_grace: Duration,
    sync_timeout: Duration,
}

impl ControllerSettings {
    /// Creates settings that look `program_name` up in `search_dirs`.
    #[must_use]
    pub fn new(program_name: impl Into<String>, search_dirs: Vec<PathBuf>) -> Self {
        Self {
            program_name: program_name.into(),
            search_dirs,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
        }
    }

    /// Derives settings from the server configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.program_name(), config.search_dirs())
            .with_terminate_grace(config.terminate_timeout())
            .with_sync_timeout(config.ready_timeout().unwrap_or(DEFAULT_SYNC_TIMEOUT))
    }

    /// Overrides the grace period between SIGTERM and SIGKILL.
    #[must_use]
    pub const fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Overrides the batch acknowledgement deadline.
    #[must_use]
    pub const fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Executable name looked up on the search path.
    #[must_use]
    pub fn program_name(&self) -> &str {
        &self.program_name
    }

    /// Grace period between SIGTERM and SIGKILL.
    #[must_use]
    pub const fn terminate_grace(&self) -> Duration {
        self.terminate_grace
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM_NAME, Vec::new())
    }
}

/// The sandbox a build ran in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSummary {
    /// Process serving the mount.
    pub pid: u32,
    /// Mount point the build used.
    pub mount_path: PathBuf,
    /// Whether the process was retained from an earlier build.
    pub reused: bool,
}

/// Everything the controller reports about one build.
#[derive(Debug)]
pub struct BuildOutcome<T> {
    /// Sandbox the build ran in, if one was used.
    pub sandbox: Option<SandboxSummary>,
    /// Action result, or the diagnostic that aborted the build.
    pub result: Result<T, Diagnostic>,
    /// Non-fatal problems observed while preparing or tearing down.
    pub warnings: Vec<SandboxWarning>,
}

/// The build's view of its active sandbox.
///
/// Gives actions the mount point and batch acknowledgement without letting
/// them terminate the process.
#[derive(Debug)]
pub struct SandboxSession<'a, P> {
    process: &'a mut P,
    sync_timeout: Duration,
    failure: Option<SupervisorError>,
}

impl<P: SupervisedProcess> SandboxSession<'_, P> {
    /// Process serving the mount.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    /// Mount point the build runs against.
    #[must_use]
    pub fn mount_path(&self) -> &Path {
        self.process.mount_path()
    }

    /// Ends an input batch and waits for the acknowledgement.
    ///
    /// A failure is also recorded so the controller aborts the build.
    pub fn sync(&mut self) -> Result<(), SupervisorError> {
        self.process.sync(self.sync_timeout).inspect_err(|error| {
            if self.failure.is_none() {
                self.failure = Some(error.clone());
            }
        })
    }
}

struct Retained<P> {
    process: P,
    options: SandboxOptions,
}

struct Prepared<P> {
    process: P,
    reused: bool,
}

/// Coordinates the resolver, supervisor, and mount manager across builds.
pub struct SandboxLifecycleController<L: SandboxLauncher> {
    launcher: L,
    mounts: MountPointManager,
    settings: ControllerSettings,
    reporter: ErrorReporter,
    retained: Option<Retained<L::Process>>,
}

impl<L: SandboxLauncher> SandboxLifecycleController<L> {
    /// Creates a controller with no sandbox.
    pub fn new(launcher: L, mounts: MountPointManager, settings: ControllerSettings) -> Self {
        Self {
            launcher,
            mounts,
            settings,
            reporter: ErrorReporter::new(),
            retained: None,
        }
    }

    /// Launcher used for fresh sandboxes.
    pub const fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Process kept alive for debugging between builds, if any.
    pub fn retained_pid(&self) -> Option<u32> {
        self.retained.as_ref().map(|retained| retained.process.pid())
    }

    /// Mount point kept alive for debugging between builds, if any.
    pub fn retained_mount(&self) -> Option<&Path> {
        self.retained
            .as_ref()
            .map(|retained| retained.process.mount_path())
    }

    /// Runs one build.
    ///
    /// `action` receives the active sandbox session, or `None` when the
    /// sandbox is disabled. It is not invoked when the sandbox cannot be
    /// prepared.
    pub fn run_build<T, F>(&mut self, options: &SandboxOptions, action: F) -> BuildOutcome<T>
    where
        F: FnOnce(Option<&mut SandboxSession<'_, L::Process>>) -> T,
    {
        let mut warnings = Vec::new();
        let prepared = match self.prepare(options, &mut warnings) {
            Ok(prepared) => prepared,
            Err(error) => {
                return BuildOutcome {
                    sandbox: None,
                    result: Err(self.reporter.report(&error)),
                    warnings: self.announce(warnings),
                };
            }
        };

        let Some(Prepared {
            mut process,
            reused,
        }) = prepared
        else {
            let value = action(None);
            return BuildOutcome {
                sandbox: None,
                result: Ok(value),
                warnings: self.announce(warnings),
            };
        };

        let summary = SandboxSummary {
            pid: process.pid(),
            mount_path: process.mount_path().to_path_buf(),
            reused,
        };
        let mut session = SandboxSession {
            process: &mut process,
            sync_timeout: self.settings.sync_timeout,
            failure: None,
        };
        let value = action(Some(&mut session));
        let failure = session.failure.take();

        let result = match self.finish(process, options, failure, &mut warnings) {
            Ok(()) => Ok(value),
            Err(error) => Err(self.reporter.report(&error)),
        };
        BuildOutcome {
            sandbox: Some(summary),
            result,
            warnings: self.announce(warnings),
        }
    }

    /// Tears down any retained sandbox regardless of debug retention.
    ///
    /// Safe to call repeatedly; later calls find nothing to tear down.
    pub fn shutdown(&mut self) -> Vec<SandboxWarning> {
        let mut warnings = Vec::new();
        if let Some(retained) = self.retained.take() {
            info!(
                target: LIFECYCLE_TARGET,
                pid = retained.process.pid(),
                "shutting down retained sandbox"
            );
            self.teardown(retained.process, &mut warnings);
        }
        self.announce(warnings)
    }

    fn prepare(
        &mut self,
        options: &SandboxOptions,
        warnings: &mut Vec<SandboxWarning>,
    ) -> Result<Option<Prepared<L::Process>>, SandboxError> {
        let decision = decide(
            self.retained.as_ref().map(|retained| &retained.options),
            options,
        );
        debug!(target: LIFECYCLE_TARGET, decision = ?decision, "sandbox decision");

        match decision {
            Decision::Disabled => {
                self.discard_retained(warnings);
                Ok(None)
            }
            Decision::Launch => self.launch_fresh(options, warnings).map(Some),
            Decision::Restart(reason) => {
                info!(
                    target: LIFECYCLE_TARGET,
                    reason = ?reason,
                    "restarting sandbox"
                );
                self.discard_retained(warnings);
                self.launch_fresh(options, warnings).map(Some)
            }
            Decision::Reuse => match self.retained.take() {
                Some(retained) => self.reuse(retained.process, options, warnings).map(Some),
                None => self.launch_fresh(options, warnings).map(Some),
            },
        }
    }

    fn reuse(
        &mut self,
        mut process: L::Process,
        options: &SandboxOptions,
        warnings: &mut Vec<SandboxWarning>,
    ) -> Result<Prepared<L::Process>, SandboxError> {
        if let Err(error) = process.ensure_alive() {
            warnings.push(SandboxWarning::RetainedProcessLost { error });
            self.teardown(process, warnings);
            return self.launch_fresh(options, warnings);
        }

        if let Err(error) = activate(&mut process, self.settings.sync_timeout) {
            self.teardown(process, warnings);
            return Err(SandboxError::from_running(error));
        }

        info!(
            target: LIFECYCLE_TARGET,
            pid = process.pid(),
            mount = %process.mount_path().display(),
            "reusing retained sandbox"
        );
        Ok(Prepared {
            process,
            reused: true,
        })
    }

    fn launch_fresh(
        &mut self,
        options: &SandboxOptions,
        warnings: &mut Vec<SandboxWarning>,
    ) -> Result<Prepared<L::Process>, SandboxError> {
        let executable = resolve(
            options.explicit_path(),
            &self.settings.program_name,
            &self.settings.search_dirs,
        )?;
        let mount_path = self
            .mounts
            .allocate()
            .map_err(SandboxError::MountAllocationFailed)?;

        let mut process = match self.launcher.launch(&executable, &mount_path) {
            Ok(process) => process,
            Err(source) => {
                self.reclaim(&mount_path, warnings);
                return Err(SandboxError::LaunchFailed { executable, source });
            }
        };

        if let Err(source) = activate(&mut process, self.settings.sync_timeout) {
            self.teardown(process, warnings);
            return Err(SandboxError::LaunchFailed { executable, source });
        }

        info!(
            target: LIFECYCLE_TARGET,
            pid = process.pid(),
            mount = %mount_path.display(),
            executable = %executable.display(),
            "sandbox launched"
        );
        Ok(Prepared {
            process,
            reused: false,
        })
    }

    fn finish(
        &mut self,
        mut process: L::Process,
        options: &SandboxOptions,
        failure: Option<SupervisorError>,
        warnings: &mut Vec<SandboxWarning>,
    ) -> Result<(), SandboxError> {
        let failure = failure.or_else(|| process.ensure_alive().err());
        if let Some(error) = failure {
            self.teardown(process, warnings);
            return Err(SandboxError::from_running(error));
        }

        if options.debug() {
            process.release();
            info!(
                target: LIFECYCLE_TARGET,
                pid = process.pid(),
                mount = %process.mount_path().display(),
                "retaining sandbox for inspection"
            );
            self.retained = Some(Retained {
                process,
                options: options.clone(),
            });
        } else {
            self.teardown(process, warnings);
        }
        Ok(())
    }

    fn discard_retained(&mut self, warnings: &mut Vec<SandboxWarning>) {
        if let Some(retained) = self.retained.take() {
            self.teardown(retained.process, warnings);
        }
    }

    fn teardown(&self, mut process: L::Process, warnings: &mut Vec<SandboxWarning>) {
        let pid = process.pid();
        let mount_path = process.mount_path().to_path_buf();
        let grace = self.settings.terminate_grace;

        if process.terminate(grace).was_forced() {
            warnings.push(SandboxWarning::ForcedTermination { pid, grace });
        }

        let state = process.state();
        if state != ProcessState::Terminated {
            warnings.push(SandboxWarning::ReclaimFailed {
                error: MountError::StillServed {
                    path: mount_path,
                    pid,
                    state,
                },
            });
            return;
        }
        drop(process);
        self.reclaim(&mount_path, warnings);
    }

    fn reclaim(&self, mount_path: &Path, warnings: &mut Vec<SandboxWarning>) {
        if let Err(error) = self.mounts.reclaim(mount_path) {
            warnings.push(SandboxWarning::ReclaimFailed { error });
        }
    }

    fn announce(&self, warnings: Vec<SandboxWarning>) -> Vec<SandboxWarning> {
        for warning in &warnings {
            self.reporter.warn(warning);
        }
        warnings
    }
}

impl<L: SandboxLauncher> Drop for SandboxLifecycleController<L> {
    fn drop(&mut self) {
        let warnings = self.shutdown();
        if !warnings.is_empty() {
            warn!(
                target: LIFECYCLE_TARGET,
                count = warnings.len(),
                "sandbox teardown on drop reported warnings"
            );
        }
    }
}

fn activate<P: SupervisedProcess>(process: &mut P, timeout: Duration) -> Result<(), SupervisorError> {
    process.activate()?;
    process.sync(timeout)
}
