//! Locates the sandbox filesystem executable.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ResolveError;

const RESOLVE_TARGET: &str = "sandboxfs_supervisor::resolve";

/// Picks the executable to launch.
///
/// An explicit path is used as given once it is confirmed to be an executable
/// regular file. It never falls back to the search directories. Without an
/// explicit path, the first directory in `search_dirs` holding an executable
/// named `program` wins.
///
/// The function has no side effects and returns the same answer for the same
/// filesystem state.
pub fn resolve(
    explicit: Option<&Path>,
    program: &str,
    search_dirs: &[PathBuf],
) -> Result<PathBuf, ResolveError> {
    if let Some(path) = explicit {
        check_explicit(path)?;
        debug!(
            target: RESOLVE_TARGET,
            executable = %path.display(),
            "using explicit sandbox filesystem executable"
        );
        return Ok(path.to_path_buf());
    }

    for dir in search_dirs {
        if let Ok(found) = which::which_in(program, Some(dir.as_os_str()), dir) {
            debug!(
                target: RESOLVE_TARGET,
                executable = %found.display(),
                "found sandbox filesystem executable on the search path"
            );
            return Ok(found);
        }
    }

    Err(ResolveError::NotFound {
        program: program.to_owned(),
        searched: search_dirs.len(),
    })
}

fn check_explicit(path: &Path) -> Result<(), ResolveError> {
    let unusable = |reason: String| ResolveError::ExplicitPathUnusable {
        path: path.to_path_buf(),
        reason,
    };

    let metadata = fs::metadata(path).map_err(|error| unusable(error.to_string()))?;
    if !metadata.is_file() {
        return Err(unusable(String::from("not a regular file")));
    }
    if !is_executable(&metadata) {
        return Err(unusable(String::from("missing execute permission")));
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;

    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    true
}
