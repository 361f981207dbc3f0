//! Derives the on-disk locations used by the build server.
//!
//! Mount points live under a single base directory per server. The directory
//! is created on demand with owner-only permissions so other users cannot
//! traverse into live sandboxes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::Config;
use crate::defaults::default_sandbox_base_dir;

/// Canonical paths for artefacts written by the build server.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    sandbox_base_dir: PathBuf,
}

impl RuntimePaths {
    /// Derives runtime paths from the configuration and creates the base
    /// directory if it is missing.
    ///
    /// A relative base directory is resolved against the current working
    /// directory.
    pub fn from_config(config: &Config) -> Result<Self, RuntimePathsError> {
        let configured = config
            .sandbox_base_dir
            .clone()
            .map_or_else(default_sandbox_base_dir, |dir| dir.into_std_path_buf());
        let sandbox_base_dir = std::path::absolute(&configured).map_err(|source| {
            RuntimePathsError::SandboxBaseDirectory {
                path: configured.clone(),
                source,
            }
        })?;
        prepare_directory(&sandbox_base_dir).map_err(|source| {
            RuntimePathsError::SandboxBaseDirectory {
                path: sandbox_base_dir.clone(),
                source,
            }
        })?;
        Ok(Self { sandbox_base_dir })
    }

    /// Directory under which mount points are allocated.
    pub fn sandbox_base_dir(&self) -> &Path {
        self.sandbox_base_dir.as_path()
    }
}

#[cfg(unix)]
fn prepare_directory(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    fs::DirBuilder::new().recursive(true).mode(0o700).create(path)
}

#[cfg(not(unix))]
fn prepare_directory(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

/// Errors raised while deriving runtime paths.
#[derive(Debug, Error)]
pub enum RuntimePathsError {
    /// Creating the sandbox base directory failed.
    #[error("failed to prepare sandbox base directory '{}': {source}", path.display())]
    SandboxBaseDirectory {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: io::Error,
    },
}
