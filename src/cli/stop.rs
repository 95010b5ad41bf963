//! Stop command implementation.

use super::StateDirArg;
use clap::Args;
use darwin_vz_nix::config::StatePaths;
use darwin_vz_nix::pidfile;
use darwin_vz_nix::process::{self, StopOutcome};
use darwin_vz_nix::settings::Settings;
use std::time::Duration;

/// Stop the running VM.
#[derive(Args, Debug)]
pub struct StopCmd {
    /// Kill immediately (SIGKILL) instead of a graceful shutdown.
    #[arg(short, long)]
    pub force: bool,

    #[command(flatten)]
    pub state: StateDirArg,
}

impl StopCmd {
    /// Execute the stop command.
    pub fn run(self, settings: &Settings) -> darwin_vz_nix::Result<()> {
        let paths = self.state.paths(settings);
        let wait = if self.force {
            process::FORCED_STOP_WAIT
        } else {
            process::GRACEFUL_STOP_WAIT
        };
        stop_instance(&paths, self.force, wait)
    }
}

/// Signal the instance recorded under `paths` and wait up to `wait`.
pub fn stop_instance(paths: &StatePaths, force: bool, wait: Duration) -> darwin_vz_nix::Result<()> {
    let pid_file = paths.pid_file();

    let pid = match pidfile::read_pid(&pid_file) {
        Some(pid) => pid,
        None => {
            println!("No running VM found (PID file not found).");
            return Ok(());
        }
    };

    if !pidfile::is_running(pid) {
        pidfile::remove_pid(&pid_file);
        println!("No running VM found (stale PID file cleaned up).");
        return Ok(());
    }

    let signal_name = if force { "SIGKILL" } else { "SIGTERM" };
    eprintln!("Sending {} to VM process (PID: {})...", signal_name, pid);

    match process::stop_process(pid, force, wait)? {
        StopOutcome::Exited => {
            eprintln!("VM stopped.");
            // SIGKILL leaves the target no chance to clean up.
            if force {
                pidfile::remove_pid(&pid_file);
            }
        }
        StopOutcome::StillRunning => {
            tracing::warn!(pid, wait_secs = wait.as_secs(), "process outlived stop window");
            eprintln!(
                "Warning: Process {} still running after {}.",
                pid, signal_name
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_no_pid_file() {
        let dir = TempDir::new().unwrap();
        let paths = StatePaths::new(dir.path());
        stop_instance(&paths, false, Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn test_stale_pid_cleaned() {
        let dir = TempDir::new().unwrap();
        let paths = StatePaths::new(dir.path());
        pidfile::write_pid(&paths.pid_file(), 99999999).unwrap();

        stop_instance(&paths, false, Duration::from_millis(10)).unwrap();
        assert!(!paths.pid_file().exists());
    }

    #[test]
    fn test_force_stop_child() {
        let dir = TempDir::new().unwrap();
        let paths = StatePaths::new(dir.path());

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        pidfile::write_pid(&paths.pid_file(), child.id() as libc::pid_t).unwrap();
        let reaper = std::thread::spawn(move || child.wait());

        stop_instance(&paths, true, Duration::from_secs(5)).unwrap();
        reaper.join().unwrap().unwrap();
        assert!(!paths.pid_file().exists());
    }
}
