use std::env;
use std::path::PathBuf;

#[cfg(unix)]
use dirs::runtime_dir;
#[cfg(unix)]
use libc::geteuid;

use crate::logging::LogFormat;

/// Default log filter expression used by the build server.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Executable name looked up when no explicit path is configured.
pub const DEFAULT_PROGRAM_NAME: &str = "sandboxfs";

/// Grace period between SIGTERM and SIGKILL.
pub const DEFAULT_TERMINATE_TIMEOUT_MS: u64 = 5_000;

/// Readiness deadline. Zero means launch does not wait for a readiness line.
pub const DEFAULT_READY_TIMEOUT_MS: u64 = 0;

/// Default log filter expression used by the build server.
#[must_use]
pub const fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Default logging format for the build server.
#[must_use]
pub const fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Computes the directory under which mount points are allocated when none is
/// configured.
///
/// Uses `$XDG_RUNTIME_DIR/sandboxd` when a runtime directory exists. Otherwise
/// the temporary directory is namespaced by effective user id so concurrent
/// users on one host do not share mount points.
#[must_use]
pub fn default_sandbox_base_dir() -> PathBuf {
    #[cfg(unix)]
    {
        if let Some(mut dir) = runtime_dir() {
            dir.push("sandboxd");
            return dir;
        }
        let mut dir = env::temp_dir();
        dir.push("sandboxd");
        dir.push(format!("uid-{}", unsafe { geteuid() }));
        dir
    }

    #[cfg(not(unix))]
    {
        let mut dir = env::temp_dir();
        dir.push("sandboxd");
        dir
    }
}
