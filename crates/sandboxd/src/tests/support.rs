//! Test doubles shared by the build server suites.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use camino::Utf8PathBuf;
use tempfile::TempDir;

use sandboxfs_config::{Config, SandboxOptions};
use sandboxfs_supervisor::SandboxWarning;
use sandboxfs_supervisor::test_support::{FakeBehaviour, install_fake};

use crate::bootstrap::BootstrapError;
use crate::health::HealthReporter;
use crate::request::BuildReport;
use crate::server::StopReason;
use crate::shutdown::{ShutdownError, ShutdownSignal};

// ---------------------------------------------------------------------------
// Health events
// ---------------------------------------------------------------------------

/// Structured health events tracked during scenarios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    BootstrapStarting,
    BootstrapSucceeded,
    BootstrapFailed(String),
    BuildStarted(u64),
    BuildFinished { id: u64, success: bool },
    SandboxWarning(&'static str),
    ShutdownStarting(StopReason),
    ShutdownCompleted,
}

/// Records health events for assertions.
#[derive(Debug, Default)]
pub struct RecordingHealthReporter {
    events: Mutex<Vec<HealthEvent>>,
}

impl RecordingHealthReporter {
    pub fn events(&self) -> Vec<HealthEvent> {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .clone()
    }

    fn record(&self, event: HealthEvent) {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .push(event);
    }
}

impl HealthReporter for RecordingHealthReporter {
    fn bootstrap_starting(&self) {
        self.record(HealthEvent::BootstrapStarting);
    }

    fn bootstrap_succeeded(&self, _config: &Config) {
        self.record(HealthEvent::BootstrapSucceeded);
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        self.record(HealthEvent::BootstrapFailed(error.to_string()));
    }

    fn build_started(&self, id: u64, _options: &SandboxOptions) {
        self.record(HealthEvent::BuildStarted(id));
    }

    fn build_finished(&self, report: &BuildReport) {
        self.record(HealthEvent::BuildFinished {
            id: report.id,
            success: report.success,
        });
    }

    fn sandbox_warning(&self, warning: &SandboxWarning) {
        self.record(HealthEvent::SandboxWarning(warning.kind()));
    }

    fn shutdown_starting(&self, reason: StopReason) {
        self.record(HealthEvent::ShutdownStarting(reason));
    }

    fn shutdown_completed(&self) {
        self.record(HealthEvent::ShutdownCompleted);
    }
}

// ---------------------------------------------------------------------------
// Shutdown and output
// ---------------------------------------------------------------------------

/// Shutdown signal released by the test.
#[derive(Clone)]
pub struct TestShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl TestShutdownSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        let mut triggered = lock.lock().expect("shutdown mutex poisoned");
        *triggered = true;
        cvar.notify_all();
    }
}

impl ShutdownSignal for TestShutdownSignal {
    fn wait(&self) -> Result<(), ShutdownError> {
        let (lock, cvar) = &*self.inner;
        let mut triggered = lock.lock().expect("shutdown mutex poisoned");
        while !*triggered {
            triggered = cvar
                .wait(triggered)
                .expect("shutdown mutex poisoned during wait");
        }
        Ok(())
    }
}

/// Collects report lines, optionally signalling shutdown after the first.
pub struct ReportSink {
    bytes: Vec<u8>,
    trigger: Option<TestShutdownSignal>,
}

impl ReportSink {
    pub fn new(trigger: Option<TestShutdownSignal>) -> Self {
        Self {
            bytes: Vec::new(),
            trigger,
        }
    }

    pub fn reports(&self) -> Vec<serde_json::Value> {
        String::from_utf8_lossy(&self.bytes)
            .lines()
            .map(|line| serde_json::from_str(line).expect("report line is JSON"))
            .collect()
    }
}

impl Write for ReportSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.extend_from_slice(buf);
        if buf.contains(&b'\n')
            && let Some(signal) = self.trigger.take()
        {
            signal.trigger();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Temporary sandbox base directory and search path holding a fake
/// sandbox filesystem.
pub struct SandboxFixture {
    dir: TempDir,
}

impl SandboxFixture {
    pub fn new(behaviour: FakeBehaviour) -> Self {
        let dir = TempDir::new().expect("temp dir");
        install_fake(&dir.path().join("bin"), "sandboxfs", behaviour).expect("install fake");
        Self { dir }
    }

    pub fn mounts(&self) -> PathBuf {
        self.dir.path().join("mounts")
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Configuration with the sandbox enabled and fast timeouts.
    pub fn config(&self) -> Config {
        Config {
            use_sandboxfs: true,
            sandbox_base_dir: Some(utf8(self.mounts())),
            search_path: Some(utf8(self.dir.path().join("bin")).into_string()),
            terminate_timeout_ms: 500,
            ready_timeout_ms: 5_000,
            log_filter: Some(String::from("warn")),
            ..Config::default()
        }
    }
}

fn utf8(path: PathBuf) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path).expect("temporary path is UTF-8")
}
