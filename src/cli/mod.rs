//! CLI command implementations.

pub mod ssh;
pub mod start;
pub mod status;
pub mod stop;

use clap::Args;
use darwin_vz_nix::config::StatePaths;
use darwin_vz_nix::settings::Settings;
use std::path::PathBuf;

/// `--state-dir` shared by every command.
#[derive(Args, Debug, Clone, Default)]
pub struct StateDirArg {
    /// State directory [default: ~/.local/share/darwin-vz-nix]
    #[arg(long, value_name = "PATH")]
    pub state_dir: Option<PathBuf>,
}

impl StateDirArg {
    /// Flag value, else the settings file, else the per-user default.
    pub fn resolve(&self, settings: &Settings) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| settings.state_dir())
    }

    /// Derived state locations.
    pub fn paths(&self, settings: &Settings) -> StatePaths {
        StatePaths::new(self.resolve(settings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_dir_precedence() {
        let settings = Settings {
            state_dir: Some(PathBuf::from("/from/settings")),
            ..Default::default()
        };

        let flag = StateDirArg {
            state_dir: Some(PathBuf::from("/from/flag")),
        };
        assert_eq!(flag.resolve(&settings), PathBuf::from("/from/flag"));
        assert_eq!(
            StateDirArg::default().resolve(&settings),
            PathBuf::from("/from/settings")
        );
    }
}
