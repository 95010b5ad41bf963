//! Host package store housekeeping.

use crate::constants::NIX_STORE_PATH;
use crate::host::{args, CommandRunner};

const SUDO_BIN: &str = "/usr/bin/sudo";

/// Remove empty store lock files left behind by interrupted builds.
///
/// Runs non-interactively through `sudo -n`; on failure the manual command
/// is printed and start continues.
pub fn clean_stale_lock_files(runner: &dyn CommandRunner) -> bool {
    let argv = cleanup_args();

    match runner.run(SUDO_BIN, &argv) {
        Ok(output) if output.is_success() => {
            tracing::info!("cleaned stale nix store lock files");
            true
        }
        Ok(output) => {
            tracing::debug!(code = ?output.code, "lock cleanup exited unsuccessfully");
            warn_manual(&argv);
            false
        }
        Err(e) => {
            tracing::debug!(error = %e, "lock cleanup failed to run");
            warn_manual(&argv);
            false
        }
    }
}

fn cleanup_args() -> Vec<String> {
    args([
        "-n",
        "find",
        NIX_STORE_PATH,
        "-maxdepth",
        "1",
        "-name",
        "*.lock",
        "-size",
        "0",
        "-perm",
        "600",
        "-delete",
    ])
}

fn warn_manual(argv: &[String]) {
    // Quote the glob so the printed command is safe to paste.
    let command = argv[1..]
        .iter()
        .map(|a| if a.contains('*') { format!("'{}'", a) } else { a.clone() })
        .collect::<Vec<_>>()
        .join(" ");
    tracing::warn!(
        "could not clean stale nix store lock files; run manually: sudo {}",
        command
    );
}
