use std::path::{Path, PathBuf};

/// Sandbox settings in force for a single build.
///
/// Options are fixed when a build starts. The lifecycle controller compares
/// them with the options of the previous build to decide whether a retained
/// sandbox may be reused.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxOptions {
    enabled: bool,
    explicit_path: Option<PathBuf>,
    debug: bool,
}

impl SandboxOptions {
    /// Creates a set of options.
    #[must_use]
    pub const fn new(enabled: bool, explicit_path: Option<PathBuf>, debug: bool) -> Self {
        Self {
            enabled,
            explicit_path,
            debug,
        }
    }

    /// Options for a build that runs without a sandbox filesystem.
    #[must_use]
    pub const fn disabled() -> Self {
        Self::new(false, None, false)
    }

    /// Whether the build runs inside a sandbox filesystem mount.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// Explicitly configured executable, if any.
    #[must_use]
    pub fn explicit_path(&self) -> Option<&Path> {
        self.explicit_path.as_deref()
    }

    /// Whether the mount is retained after the build for inspection.
    #[must_use]
    pub const fn debug(&self) -> bool {
        self.debug
    }

    /// Returns a copy with the sandbox enabled or disabled.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Returns a copy with debug retention toggled.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Returns a copy using the given explicit executable.
    #[must_use]
    pub fn with_explicit_path(mut self, explicit_path: Option<PathBuf>) -> Self {
        self.explicit_path = explicit_path;
        self
    }
}
