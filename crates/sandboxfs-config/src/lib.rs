//! Shared configuration for the sandboxfs build server.
//!
//! The build server and its tests agree on a single [`Config`] type. Values
//! are layered by `ortho_config` from defaults, a TOML file, `SANDBOXD_*`
//! environment variables, and command-line flags, with later layers taking
//! precedence. Per-build options are derived from the loaded configuration via
//! [`Config::build_options`].

mod defaults;
mod logging;
mod options;
mod runtime;

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use defaults::{
    DEFAULT_LOG_FILTER, DEFAULT_PROGRAM_NAME, DEFAULT_READY_TIMEOUT_MS,
    DEFAULT_TERMINATE_TIMEOUT_MS, default_log_filter, default_log_format,
    default_sandbox_base_dir,
};
pub use logging::{LogFormat, LogFormatParseError};
pub use options::SandboxOptions;
pub use runtime::{RuntimePaths, RuntimePathsError};

/// Build server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "SANDBOXD")]
#[serde(default)]
pub struct Config {
    /// Runs builds inside a sandbox filesystem mount when enabled.
    #[ortho_config(default = false)]
    pub use_sandboxfs: bool,
    /// Explicit sandbox filesystem executable. Disables search path lookup.
    pub sandboxfs_path: Option<Utf8PathBuf>,
    /// Leaves the mount and its process alive after each build.
    #[ortho_config(default = false)]
    pub sandbox_debug: bool,
    /// Directory under which mount points are allocated.
    pub sandbox_base_dir: Option<Utf8PathBuf>,
    /// Executable name looked up on the search path.
    pub program_name: Option<String>,
    /// Directories searched for the executable, in `PATH` syntax.
    pub search_path: Option<String>,
    /// Grace period between SIGTERM and SIGKILL, in milliseconds.
    #[ortho_config(default = 5000)]
    pub terminate_timeout_ms: u64,
    /// Deadline for the readiness line after launch. Zero skips the wait.
    #[ortho_config(default = 0)]
    pub ready_timeout_ms: u64,
    /// Tracing filter expression.
    pub log_filter: Option<String>,
    /// Log output format.
    pub log_format: Option<LogFormat>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            use_sandboxfs: false,
            sandboxfs_path: None,
            sandbox_debug: false,
            sandbox_base_dir: None,
            program_name: None,
            search_path: None,
            terminate_timeout_ms: DEFAULT_TERMINATE_TIMEOUT_MS,
            ready_timeout_ms: DEFAULT_READY_TIMEOUT_MS,
            log_filter: None,
            log_format: None,
        }
    }
}

impl Config {
    /// Returns the tracing filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }

    /// Returns the log output format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format.unwrap_or_else(default_log_format)
    }

    /// Returns the executable name used for search path lookup.
    #[must_use]
    pub fn program_name(&self) -> &str {
        self.program_name.as_deref().unwrap_or(DEFAULT_PROGRAM_NAME)
    }

    /// Returns the ordered directories searched for the executable.
    ///
    /// Falls back to the process `PATH` when no search path is configured.
    #[must_use]
    pub fn search_dirs(&self) -> Vec<PathBuf> {
        match self.search_path.as_deref() {
            Some(configured) => env::split_paths(configured).collect(),
            None => env::var_os("PATH")
                .map(|path| env::split_paths(&path).collect())
                .unwrap_or_default(),
        }
    }

    /// Grace period granted to the sandbox process after SIGTERM.
    #[must_use]
    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }

    /// Deadline for the readiness line, or `None` when launch does not wait.
    #[must_use]
    pub const fn ready_timeout(&self) -> Option<Duration> {
        if self.ready_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.ready_timeout_ms))
        }
    }

    /// Derives the sandbox options applied to builds that do not override
    /// them.
    #[must_use]
    pub fn build_options(&self) -> SandboxOptions {
        SandboxOptions::new(
            self.use_sandboxfs,
            self.sandboxfs_path.clone().map(Utf8PathBuf::into_std_path_buf),
            self.sandbox_debug,
        )
    }
}
