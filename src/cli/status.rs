//! Status command implementation.

use super::StateDirArg;
use clap::Args;
use darwin_vz_nix::config::StatePaths;
use darwin_vz_nix::pidfile;
use darwin_vz_nix::settings::Settings;
use serde::Serialize;

/// Show whether the VM is running.
#[derive(Args, Debug)]
pub struct StatusCmd {
    /// Output as JSON.
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub state: StateDirArg,
}

/// Status as reported to the operator. Fields are declared in key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub pid: Option<i32>,
    pub running: bool,
    pub state_directory: String,
}

impl StatusReport {
    /// Inspect `paths`, removing a stale PID marker.
    pub fn collect(paths: &StatePaths) -> Self {
        let pid_file = paths.pid_file();
        let recorded = pidfile::read_pid(&pid_file);
        let live = recorded.filter(|&pid| pidfile::is_running(pid));

        if recorded.is_some() && live.is_none() {
            tracing::debug!(pid = ?recorded, "removing stale pid file");
            pidfile::remove_pid(&pid_file);
        }

        Self {
            pid: live,
            running: live.is_some(),
            state_directory: paths.root().display().to_string(),
        }
    }

    /// Human-readable lines.
    pub fn render(&self) -> String {
        let mut out = String::new();
        match self.pid {
            Some(pid) if self.running => {
                out.push_str("VM Status: Running\n");
                out.push_str(&format!("PID: {}\n", pid));
            }
            _ => out.push_str("VM Status: Stopped\n"),
        }
        out.push_str(&format!("State Directory: {}", self.state_directory));
        out
    }
}

impl StatusCmd {
    /// Execute the status command.
    pub fn run(self, settings: &Settings) -> darwin_vz_nix::Result<()> {
        let report = StatusReport::collect(&self.state.paths(settings));

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("{}", report.render());
        }
        Ok(())
    }
}
