//! Allocation and reclamation of sandbox mount points.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::MountError;

const MOUNT_TARGET: &str = "sandboxfs_supervisor::mount";

/// Upper bound on name collisions skipped during one allocation.
const MAX_ALLOCATION_ATTEMPTS: u32 = 64;

/// Location of one mount point: a base directory shared by the server and a
/// name unique to a single sandbox process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    sandbox_base_dir: PathBuf,
    mount_name: String,
}

impl MountRequest {
    /// Creates a request for `mount_name` under `sandbox_base_dir`.
    #[must_use]
    pub fn new(sandbox_base_dir: impl Into<PathBuf>, mount_name: impl Into<String>) -> Self {
        Self {
            sandbox_base_dir: sandbox_base_dir.into(),
            mount_name: mount_name.into(),
        }
    }

    /// Directory shared by every mount point of the server.
    #[must_use]
    pub fn sandbox_base_dir(&self) -> &Path {
        &self.sandbox_base_dir
    }

    /// Name of the mount point directory.
    #[must_use]
    pub fn mount_name(&self) -> &str {
        &self.mount_name
    }

    /// Full path of the mount point.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.sandbox_base_dir.join(&self.mount_name)
    }
}

/// Hands out mount point directories under the server's sandbox base
/// directory.
///
/// Names combine the server pid with a counter that only moves forward, so a
/// path handed out once is never handed out again by the same manager. A name
/// already present on disk, left over from an earlier server with the same
/// pid, is skipped.
#[derive(Debug)]
pub struct MountPointManager {
    sandbox_base_dir: PathBuf,
    server_pid: u32,
    next_index: u64,
}

impl MountPointManager {
    /// Creates a manager for the current server process.
    #[must_use]
    pub fn new(sandbox_base_dir: impl Into<PathBuf>) -> Self {
        Self::with_server_pid(sandbox_base_dir, std::process::id())
    }

    /// Creates a manager that names mount points after `server_pid`.
    #[must_use]
    pub fn with_server_pid(sandbox_base_dir: impl Into<PathBuf>, server_pid: u32) -> Self {
        Self {
            sandbox_base_dir: sandbox_base_dir.into(),
            server_pid,
            next_index: 0,
        }
    }

    /// Directory under which mount points are created.
    #[must_use]
    pub fn sandbox_base_dir(&self) -> &Path {
        &self.sandbox_base_dir
    }

    /// Creates a fresh, empty mount point directory and returns its absolute
    /// path.
    ///
    /// A relative base directory is anchored to the current working directory
    /// on first use.
    pub fn allocate(&mut self) -> Result<PathBuf, MountError> {
        if self.sandbox_base_dir.is_relative() {
            self.sandbox_base_dir =
                std::path::absolute(&self.sandbox_base_dir).map_err(|source| {
                    MountError::Allocate {
                        path: self.sandbox_base_dir.clone(),
                        source: Arc::new(source),
                    }
                })?;
        }
        fs::create_dir_all(&self.sandbox_base_dir).map_err(|source| MountError::Allocate {
            path: self.sandbox_base_dir.clone(),
            source: Arc::new(source),
        })?;

        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let path = self.next_request().path();
            match fs::create_dir(&path) {
                Ok(()) => {
                    debug!(
                        target: MOUNT_TARGET,
                        mount = %path.display(),
                        "allocated mount point"
                    );
                    return Ok(path);
                }
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(
                        target: MOUNT_TARGET,
                        mount = %path.display(),
                        "skipping stale mount point name"
                    );
                }
                Err(source) => {
                    return Err(MountError::Allocate {
                        path,
                        source: Arc::new(source),
                    });
                }
            }
        }

        Err(MountError::Allocate {
            path: self.sandbox_base_dir.clone(),
            source: Arc::new(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{MAX_ALLOCATION_ATTEMPTS} consecutive mount point names were taken"),
            )),
        })
    }

    /// Removes a mount point tree.
    ///
    /// A path that no longer exists counts as reclaimed. Callers must only
    /// reclaim once the process serving the mount has terminated.
    pub fn reclaim(&self, mount_path: &Path) -> Result<(), MountError> {
        match fs::remove_dir_all(mount_path) {
            Ok(()) => {
                debug!(
                    target: MOUNT_TARGET,
                    mount = %mount_path.display(),
                    "reclaimed mount point"
                );
                Ok(())
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => {
                warn!(
                    target: MOUNT_TARGET,
                    mount = %mount_path.display(),
                    error = %source,
                    "failed to reclaim mount point"
                );
                Err(MountError::Reclaim {
                    path: mount_path.to_path_buf(),
                    source: Arc::new(source),
                })
            }
        }
    }

    fn next_request(&mut self) -> MountRequest {
        let index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);
        MountRequest::new(
            self.sandbox_base_dir.clone(),
            format!("sandboxfs-{}-{index}", self.server_pid),
        )
    }
}
