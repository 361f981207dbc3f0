//! Crate-level unit and behaviour tests.

use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

use mockall::mock;
use ortho_config::OrthoConfig;
use rstest::rstest;

use sandboxfs_supervisor::test_support::{FakeBehaviour, process_exists};

use crate::bootstrap::{ConfigLoader, StaticConfigLoader, bootstrap_with};
use crate::executor::{ActionExecutor, CommandOutcome, ExecutorError};
use crate::request::BuildRequest;

use self::support::{HealthEvent, RecordingHealthReporter, SandboxFixture};

mod support;

mock! {
    Executor {}
    impl ActionExecutor for Executor {
        fn execute<'a>(
            &self,
            command: &[String],
            mount_path: Option<&'a Path>,
        ) -> Result<CommandOutcome, ExecutorError>;
    }
}

const PASSED: CommandOutcome = CommandOutcome {
    success: true,
    exit_code: Some(0),
};

struct FailingConfigLoader;

impl ConfigLoader for FailingConfigLoader {
    fn load(&self) -> Result<sandboxfs_config::Config, Arc<ortho_config::OrthoError>> {
        let args = vec![
            OsString::from("sandboxd"),
            OsString::from("--terminate-timeout-ms"),
            OsString::from("soon"),
        ];
        sandboxfs_config::Config::load_from_iter(args)
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

#[test]
fn bootstrap_prepares_the_sandbox_base_directory() {
    let fixture = SandboxFixture::new(FakeBehaviour::Cooperative);
    let reporter = Arc::new(RecordingHealthReporter::default());

    let server = bootstrap_with(&StaticConfigLoader::new(fixture.config()), reporter.clone())
        .expect("bootstrap");

    assert!(fixture.mounts().is_dir());
    assert!(server.retained_pid().is_none());
    assert_eq!(
        reporter.events(),
        [HealthEvent::BootstrapStarting, HealthEvent::BootstrapSucceeded]
    );
}

#[test]
fn bootstrap_reports_configuration_failures() {
    let reporter = Arc::new(RecordingHealthReporter::default());

    let error = bootstrap_with(&FailingConfigLoader, reporter.clone())
        .err()
        .expect("bootstrap must fail");

    let events = reporter.events();
    assert!(matches!(
        events.as_slice(),
        [HealthEvent::BootstrapStarting, HealthEvent::BootstrapFailed(message)]
            if *message == error.to_string()
    ));
}

#[test]
fn bootstrap_reports_unusable_base_directories() {
    let fixture = SandboxFixture::new(FakeBehaviour::Cooperative);
    let blocker = fixture.path().join("blocker");
    std::fs::write(&blocker, "").expect("write file");
    let mut config = fixture.config();
    config.sandbox_base_dir = camino::Utf8PathBuf::from_path_buf(blocker.join("mounts")).ok();

    let error = bootstrap_with(
        &StaticConfigLoader::new(config),
        Arc::new(RecordingHealthReporter::default()),
    )
    .err()
    .expect("bootstrap must fail");

    assert!(matches!(error, crate::BootstrapError::Runtime { .. }), "{error}");
}

// ---------------------------------------------------------------------------
// Builds
// ---------------------------------------------------------------------------

#[test]
fn disabled_sandbox_runs_the_command_in_place() {
    let fixture = SandboxFixture::new(FakeBehaviour::Cooperative);
    let mut config = fixture.config();
    config.use_sandboxfs = false;
    let mut server = bootstrap_with(
        &StaticConfigLoader::new(config),
        Arc::new(RecordingHealthReporter::default()),
    )
    .expect("bootstrap");
    let mut executor = MockExecutor::new();
    executor
        .expect_execute()
        .withf(|command, mount| command.len() == 1 && mount.is_none())
        .times(1)
        .returning(|_, _| Ok(PASSED));

    let report = server.run_build(&BuildRequest::new(["true"]), &executor);

    assert!(report.success);
    assert_eq!(report.exit_code, Some(0));
    assert!(report.sandbox.is_none());
}

#[test]
fn enabled_sandbox_hands_the_mount_to_the_command() {
    let fixture = SandboxFixture::new(FakeBehaviour::Cooperative);
    let mounts = fixture.mounts();
    let mut server = bootstrap_with(
        &StaticConfigLoader::new(fixture.config()),
        Arc::new(RecordingHealthReporter::default()),
    )
    .expect("bootstrap");
    let mut executor = MockExecutor::new();
    executor
        .expect_execute()
        .times(1)
        .returning(move |_, mount| {
            let served = mount.is_some_and(|path| {
                path.starts_with(&mounts) && path.join(".served-by").is_file()
            });
            Ok(CommandOutcome {
                success: served,
                exit_code: Some(i32::from(!served)),
            })
        });

    let report = server.run_build(&BuildRequest::new(["make"]), &executor);

    assert!(report.success, "{report:?}");
    let sandbox = report.sandbox.expect("sandbox used");
    assert!(!sandbox.reused);
    assert!(!process_exists(sandbox.pid));
    assert!(!sandbox.mount_path.exists());
}

#[rstest]
#[case::spawn_failure(
    ExecutorError::Spawn { program: String::from("make"), source: std::io::Error::other("denied") },
    "Build command failed: failed to run 'make': denied"
)]
#[case::empty(ExecutorError::EmptyCommand, "Build command failed: no program given")]
fn executor_failures_fail_the_build(#[case] failure: ExecutorError, #[case] expected: &str) {
    let fixture = SandboxFixture::new(FakeBehaviour::Cooperative);
    let mut config = fixture.config();
    config.use_sandboxfs = false;
    let mut server = bootstrap_with(
        &StaticConfigLoader::new(config),
        Arc::new(RecordingHealthReporter::default()),
    )
    .expect("bootstrap");
    let mut failure = Some(failure);
    let mut executor = MockExecutor::new();
    executor
        .expect_execute()
        .times(1)
        .returning(move |_, _| Err(failure.take().expect("called once")));

    let report = server.run_build(&BuildRequest::new(["make"]), &executor);

    assert!(!report.success);
    assert_eq!(report.diagnostic.as_deref(), Some(expected));
}

#[test]
fn malformed_lines_are_numbered_and_rejected() {
    let fixture = SandboxFixture::new(FakeBehaviour::Cooperative);
    let reporter = Arc::new(RecordingHealthReporter::default());
    let mut server = bootstrap_with(&StaticConfigLoader::new(fixture.config()), reporter.clone())
        .expect("bootstrap");
    let mut executor = MockExecutor::new();
    executor.expect_execute().never();

    let first = server.handle_line("make all", &executor);
    let second = server.handle_line(r#"{"command": []}"#, &executor);

    assert_eq!((first.id, second.id), (1, 2));
    assert!(!first.success && !second.success);
    assert!(
        reporter
            .events()
            .contains(&HealthEvent::BuildFinished { id: 2, success: false })
    );
}
