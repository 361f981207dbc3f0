//! Fake sandbox filesystem executables for tests.
//!
//! The fakes are POSIX shell scripts. They honour the line protocol closely
//! enough to exercise the supervisor: a `Ready` line on start, `Done` for
//! every empty input line, and SIGTERM handling that varies by behaviour.
//! The cooperative fake writes its pid to `.served-by` inside the mount
//! point, which is always the last argument.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

const COOPERATIVE: &str = r#"#!/bin/sh
for mount in "$@"; do :; done
reader=
trap 'kill "$reader" 2>/dev/null; echo Terminated >&2; exit 0' TERM
echo "$$" > "$mount/.served-by"
exec 3<&0
( while IFS= read -r line <&3; do if [ -z "$line" ]; then echo Done; fi; done ) &
reader=$!
echo Ready
wait "$reader"
"#;

const IGNORES_TERM: &str = r#"#!/bin/sh
trap '' TERM
exec 3<&0
( while IFS= read -r line <&3; do if [ -z "$line" ]; then echo Done; fi; done ) &
echo Ready
wait
"#;

const EXITS_AFTER_READY: &str = "#!/bin/sh\necho Ready\nexit 3\n";

const CRASHES_AFTER_FIRST_BATCH: &str = r#"#!/bin/sh
echo Ready
IFS= read -r line
echo Done
IFS= read -r line
exit 7
"#;

const SILENT: &str = "#!/bin/sh\nexec sleep 30\n";

/// Behaviour of a fake sandbox filesystem executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeBehaviour {
    /// Acknowledges batches and exits promptly on SIGTERM.
    Cooperative,
    /// Acknowledges batches but ignores SIGTERM.
    IgnoresTerm,
    /// Announces readiness and exits at once with status 3.
    ExitsAfterReady,
    /// Acknowledges one batch, then exits with status 7 on the next line.
    CrashesAfterFirstBatch,
    /// Never writes anything.
    Silent,
}

impl FakeBehaviour {
    const fn script(self) -> &'static str {
        match self {
            Self::Cooperative => COOPERATIVE,
            Self::IgnoresTerm => IGNORES_TERM,
            Self::ExitsAfterReady => EXITS_AFTER_READY,
            Self::CrashesAfterFirstBatch => CRASHES_AFTER_FIRST_BATCH,
            Self::Silent => SILENT,
        }
    }
}

/// Writes an executable fake named `name` into `dir` and returns its path.
pub fn install_fake(dir: &Path, name: &str, behaviour: FakeBehaviour) -> io::Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    fs::create_dir_all(dir)?;
    let path = dir.join(name);
    fs::write(&path, behaviour.script())?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

/// Reads the pid recorded by a cooperative fake in its mount point.
#[must_use]
pub fn served_by(mount_path: &Path) -> Option<u32> {
    fs::read_to_string(mount_path.join(".served-by"))
        .ok()
        .and_then(|text| text.trim().parse().ok())
}

/// Whether a process with `pid` exists.
#[must_use]
pub fn process_exists(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}
