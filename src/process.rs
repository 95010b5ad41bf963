//! Process management utilities.
//!
//! Liveness probes and signal delivery for the VM host process, used by
//! `stop`, `status` and the singleton check.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// How long `stop` waits after SIGTERM.
pub const GRACEFUL_STOP_WAIT: Duration = Duration::from_secs(30);

/// How long `stop --force` waits after SIGKILL.
pub const FORCED_STOP_WAIT: Duration = Duration::from_secs(2);

/// Liveness polling interval while waiting for exit.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// PID of the current process.
pub fn current_pid() -> libc::pid_t {
    std::process::id() as libc::pid_t
}

/// Check if a process is alive.
///
/// Sends signal 0. Any failure, including EPERM for a process owned by
/// someone else, counts as not running.
pub fn is_alive(pid: libc::pid_t) -> bool {
    if pid <= 0 {
        return false;
    }
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Send `signal` to `pid`.
pub fn send_signal(pid: libc::pid_t, signal: libc::c_int) -> Result<()> {
    if unsafe { libc::kill(pid, signal) } == 0 {
        Ok(())
    } else {
        Err(Error::Signal {
            pid,
            source: std::io::Error::last_os_error(),
        })
    }
}

/// Send SIGTERM to a process.
pub fn terminate(pid: libc::pid_t) -> Result<()> {
    send_signal(pid, libc::SIGTERM)
}

/// Send SIGKILL to a process.
pub fn kill(pid: libc::pid_t) -> Result<()> {
    send_signal(pid, libc::SIGKILL)
}

/// Poll until `pid` exits or `timeout` elapses.
///
/// Returns true if the process is gone.
pub fn wait_for_exit(pid: libc::pid_t, timeout: Duration, poll_interval: Duration) -> bool {
    let start = Instant::now();

    while is_alive(pid) {
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(poll_interval);
    }

    true
}

/// Outcome of [`stop_process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process exited within the wait window.
    Exited,
    /// The process was still alive when the window closed.
    StillRunning,
}

/// Signal a process and wait for it to exit.
///
/// Sends SIGKILL when `force` is set, SIGTERM otherwise, then polls
/// liveness every [`POLL_INTERVAL`] for up to `timeout`.
pub fn stop_process(pid: libc::pid_t, force: bool, timeout: Duration) -> Result<StopOutcome> {
    if force {
        kill(pid)?;
    } else {
        terminate(pid)?;
    }

    if wait_for_exit(pid, timeout, POLL_INTERVAL) {
        Ok(StopOutcome::Exited)
    } else {
        tracing::debug!(pid, force, "process outlived stop window");
        Ok(StopOutcome::StillRunning)
    }
}
