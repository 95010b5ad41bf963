//! Singleton registry.
//!
//! A `vm.pid` marker in the state directory records the orchestrator's
//! PID. File presence alone proves nothing (a crash leaves it behind), so
//! callers pair [`read_pid`] with [`is_running`].

use crate::error::{Error, Result};
use crate::process;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const PID_FILE_MODE: u32 = 0o644;

/// Read the PID recorded at `path`.
///
/// Returns `None` when the file is missing or does not hold an integer.
pub fn read_pid(path: &Path) -> Option<libc::pid_t> {
    let content = std::fs::read_to_string(path).ok()?;
    content.trim().parse().ok()
}

/// Zero-signal existence probe.
pub fn is_running(pid: libc::pid_t) -> bool {
    process::is_alive(pid)
}

/// PID of a live instance recorded at `path`, if any.
pub fn live_pid(path: &Path) -> Option<libc::pid_t> {
    read_pid(path).filter(|&pid| is_running(pid))
}

/// Atomically create or replace the marker at `path`.
pub fn write_pid(path: &Path, pid: libc::pid_t) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::PidFile(format!("{} has no parent directory", path.display())))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::PidFile(format!("{}: {}", path.display(), e)))?;
    write!(tmp, "{}", pid).map_err(|e| Error::PidFile(e.to_string()))?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(PID_FILE_MODE))
        .map_err(|e| Error::PidFile(e.to_string()))?;
    tmp.persist(path)
        .map_err(|e| Error::PidFile(format!("{}: {}", path.display(), e.error)))?;

    tracing::debug!(pid, path = %path.display(), "wrote pid file");
    Ok(())
}

/// Remove the marker. Missing files are ignored.
pub fn remove_pid(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed pid file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove pid file"),
    }
}

/// Fail if a live instance already owns `path`.
pub fn ensure_not_running(path: &Path) -> Result<()> {
    match live_pid(path) {
        Some(pid) => Err(Error::AlreadyRunning { pid }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_missing_and_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vm.pid");
        assert_eq!(read_pid(&path), None);

        std::fs::write(&path, "not-a-pid").unwrap();
        assert_eq!(read_pid(&path), None);

        std::fs::write(&path, " 1234\n").unwrap();
        assert_eq!(read_pid(&path), Some(1234));
    }

    #[test]
    fn test_write_then_probe_then_remove() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vm.pid");
        let pid = process::current_pid();

        write_pid(&path, pid).unwrap();
        assert_eq!(read_pid(&path), Some(pid));
        assert!(is_running(pid));
        assert_eq!(live_pid(&path), Some(pid));

        remove_pid(&path);
        assert_eq!(read_pid(&path), None);
        remove_pid(&path);
    }

    #[test]
    fn test_write_replaces_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vm.pid");
        write_pid(&path, 1).unwrap();
        write_pid(&path, 2).unwrap();
        assert_eq!(read_pid(&path), Some(2));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_stale_marker_is_not_live() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vm.pid");
        write_pid(&path, 99999999).unwrap();
        assert_eq!(live_pid(&path), None);
        ensure_not_running(&path).unwrap();
    }

    #[test]
    fn test_live_marker_conflicts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vm.pid");
        write_pid(&path, process::current_pid()).unwrap();
        assert!(matches!(
            ensure_not_running(&path),
            Err(Error::AlreadyRunning { .. })
        ));
    }
}
