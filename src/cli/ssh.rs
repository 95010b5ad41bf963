//! SSH command implementation.

use super::StateDirArg;
use clap::Args;
use darwin_vz_nix::host::ExecReplacer;
use darwin_vz_nix::pidfile;
use darwin_vz_nix::settings::Settings;
use darwin_vz_nix::ssh::SshSession;
use darwin_vz_nix::Error;

/// Open a shell on the VM.
#[derive(Args, Debug)]
pub struct SshCmd {
    #[command(flatten)]
    pub state: StateDirArg,

    /// Additional arguments passed to ssh.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub extra_args: Vec<String>,
}

impl SshCmd {
    /// Execute the ssh command. Only returns on failure.
    pub fn run(self, settings: &Settings) -> darwin_vz_nix::Result<()> {
        let paths = self.state.paths(settings);

        if pidfile::live_pid(&paths.pid_file()).is_none() {
            return Err(Error::NotRunning);
        }

        SshSession::new(paths).connect(&self.extra_args, &ExecReplacer)
    }
}
