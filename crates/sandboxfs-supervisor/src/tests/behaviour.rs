//! Behaviour-driven tests for the sandbox lifecycle across builds.

use std::path::PathBuf;
use std::time::Duration;

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use sandboxfs_config::SandboxOptions;
use tempfile::TempDir;

use crate::test_support::{FakeBehaviour, install_fake, process_exists, served_by};
use crate::{
    ControllerSettings, Diagnostic, MountPointManager, ProcessSupervisor,
    SandboxLifecycleController, SandboxSummary, SandboxWarning,
};

const READY: Option<Duration> = Some(Duration::from_secs(5));
const GRACE: Duration = Duration::from_millis(300);

// ---------------------------------------------------------------------------
// Test world
// ---------------------------------------------------------------------------

struct BuildRecord {
    sandbox: Option<SandboxSummary>,
    diagnostic: Option<Diagnostic>,
    warnings: Vec<SandboxWarning>,
    alive_during_build: bool,
    served_by: Option<u32>,
    previous_mount_existed: Option<bool>,
}

struct LifecycleWorld {
    controller: Option<SandboxLifecycleController<ProcessSupervisor>>,
    explicit: Option<PathBuf>,
    builds: Vec<BuildRecord>,
    dir: TempDir,
}

#[fixture]
fn world() -> LifecycleWorld {
    LifecycleWorld {
        controller: None,
        explicit: None,
        builds: Vec::new(),
        dir: TempDir::new().expect("temp dir"),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

impl LifecycleWorld {
    fn install(&mut self, behaviour: FakeBehaviour) {
        let bin = self.dir.path().join("bin");
        install_fake(&bin, "sandboxfs", behaviour).expect("install fake");
        let settings = ControllerSettings::new("sandboxfs", vec![bin]).with_terminate_grace(GRACE);
        let mounts = MountPointManager::new(self.dir.path().join("mounts"));
        let launcher = ProcessSupervisor::new()
            .with_ready_timeout(READY)
            .with_drop_grace(GRACE);
        self.controller = Some(SandboxLifecycleController::new(launcher, mounts, settings));
    }

    fn controller(&mut self) -> &mut SandboxLifecycleController<ProcessSupervisor> {
        self.controller.as_mut().expect("no executable installed")
    }

    fn build(&self, number: usize) -> &BuildRecord {
        let index = number.checked_sub(1).expect("builds are numbered from 1");
        self.builds.get(index).expect("build did not run")
    }

    fn sandbox(&self, number: usize) -> &SandboxSummary {
        self.build(number)
            .sandbox
            .as_ref()
            .expect("build ran without a sandbox")
    }
}

// ---------------------------------------------------------------------------
// Given steps
// ---------------------------------------------------------------------------

#[given("a sandbox filesystem executable on the search path")]
fn given_cooperative(world: &mut LifecycleWorld) {
    world.install(FakeBehaviour::Cooperative);
}

#[given("a sandbox filesystem executable that ignores SIGTERM")]
fn given_stubborn(world: &mut LifecycleWorld) {
    world.install(FakeBehaviour::IgnoresTerm);
}

#[given("the explicit sandbox filesystem path \"{path}\"")]
fn given_explicit(world: &mut LifecycleWorld, path: String) {
    world.explicit = Some(PathBuf::from(path));
}

// ---------------------------------------------------------------------------
// When steps
// ---------------------------------------------------------------------------

#[when("a build runs with debug retention {state}")]
fn when_build(world: &mut LifecycleWorld, state: String) {
    let debug = match state.as_str() {
        "enabled" => true,
        "disabled" => false,
        other => panic!("unsupported retention state: '{other}'"),
    };
    let options = SandboxOptions::new(true, world.explicit.clone(), debug);
    let previous_mount = world
        .builds
        .last()
        .and_then(|record| record.sandbox.as_ref())
        .map(|summary| summary.mount_path.clone());

    let outcome = world.controller().run_build(&options, |session| {
        let session = session.expect("sandbox enabled");
        (
            process_exists(session.pid()),
            served_by(session.mount_path()),
            previous_mount.map(|path| path.exists()),
        )
    });

    let (alive_during_build, served, previous_mount_existed) = match &outcome.result {
        Ok((alive, served, previous)) => (*alive, *served, *previous),
        Err(_) => (false, None, None),
    };
    world.builds.push(BuildRecord {
        sandbox: outcome.sandbox,
        diagnostic: outcome.result.err(),
        warnings: outcome.warnings,
        alive_during_build,
        served_by: served,
        previous_mount_existed,
    });
}

#[when("the server shuts down")]
fn when_shutdown(world: &mut LifecycleWorld) {
    let warnings = world.controller().shutdown();
    assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
}

// ---------------------------------------------------------------------------
// Then steps
// ---------------------------------------------------------------------------

#[then("build {number} ran against a live sandbox")]
fn then_live(world: &mut LifecycleWorld, number: usize) {
    let record = world.build(number);
    assert!(record.diagnostic.is_none(), "build failed: {:?}", record.diagnostic);
    assert!(record.alive_during_build, "sandbox was not running");
    let summary = world.sandbox(number);
    assert_eq!(record.served_by, Some(summary.pid));
}

#[then("the sandbox of build {number} is gone")]
fn then_gone(world: &mut LifecycleWorld, number: usize) {
    let summary = world.sandbox(number);
    assert!(
        !process_exists(summary.pid),
        "process {} is still running",
        summary.pid
    );
    assert!(
        !summary.mount_path.exists(),
        "mount {} was not reclaimed",
        summary.mount_path.display()
    );
}

#[then("build {number} failed with a diagnostic naming \"{path}\"")]
fn then_failed(world: &mut LifecycleWorld, number: usize, path: String) {
    let record = world.build(number);
    let diagnostic = record.diagnostic.as_ref().expect("build should fail");
    assert!(
        diagnostic.message().contains(&path),
        "diagnostic '{diagnostic}' does not name {path}"
    );
    assert!(record.sandbox.is_none());
    assert!(world.controller.as_ref().is_some_and(|c| c.retained_pid().is_none()));
}

#[then("builds {first} and {second} shared one sandbox")]
fn then_shared(world: &mut LifecycleWorld, first: usize, second: usize) {
    let (a, b) = (world.sandbox(first), world.sandbox(second));
    assert_eq!(a.pid, b.pid);
    assert_eq!(a.mount_path, b.mount_path);
    assert!(b.reused);
}

#[then("builds {first} and {second} used different sandboxes")]
fn then_different(world: &mut LifecycleWorld, first: usize, second: usize) {
    let (a, b) = (world.sandbox(first), world.sandbox(second));
    assert_ne!(a.pid, b.pid);
    assert_ne!(a.mount_path, b.mount_path);
    assert!(!b.reused);
}

#[then("the mount of build {first} was gone while build {second} ran")]
fn then_previous_gone(world: &mut LifecycleWorld, first: usize, second: usize) {
    let mount = &world.sandbox(first).mount_path;
    assert!(!mount.exists(), "mount {} still exists", mount.display());
    assert_eq!(world.build(second).previous_mount_existed, Some(false));
}

#[then("build {number} reported a forced termination")]
fn then_forced(world: &mut LifecycleWorld, number: usize) {
    let warnings = &world.build(number).warnings;
    assert!(
        warnings
            .iter()
            .any(|warning| matches!(warning, SandboxWarning::ForcedTermination { .. })),
        "expected a forced termination warning, got {warnings:?}"
    );
}

// ---------------------------------------------------------------------------
// Scenario registration
// ---------------------------------------------------------------------------

#[scenario(
    path = "tests/features/sandbox_lifecycle.feature",
    name = "A fresh server launches the sandbox found on the search path"
)]
fn fresh_server_launches(world: LifecycleWorld) {
    let _ = world;
}

#[scenario(
    path = "tests/features/sandbox_lifecycle.feature",
    name = "A missing explicit executable aborts the build"
)]
fn missing_explicit_executable(world: LifecycleWorld) {
    let _ = world;
}

#[scenario(
    path = "tests/features/sandbox_lifecycle.feature",
    name = "Consecutive debug builds share one sandbox"
)]
fn debug_builds_share_sandbox(world: LifecycleWorld) {
    let _ = world;
}

#[scenario(
    path = "tests/features/sandbox_lifecycle.feature",
    name = "Turning debug retention off replaces the sandbox"
)]
fn debug_toggle_replaces_sandbox(world: LifecycleWorld) {
    let _ = world;
}

#[scenario(
    path = "tests/features/sandbox_lifecycle.feature",
    name = "Shutdown tears down a retained sandbox"
)]
fn shutdown_tears_down(world: LifecycleWorld) {
    let _ = world;
}

#[scenario(
    path = "tests/features/sandbox_lifecycle.feature",
    name = "A sandbox that ignores SIGTERM is killed"
)]
fn stubborn_sandbox_is_killed(world: LifecycleWorld) {
    let _ = world;
}
