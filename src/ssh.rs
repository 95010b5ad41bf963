//! SSH key provisioning and remote shell launch.

use crate::constants::{SSH_KEY_COMMENT, SSH_USER};
use crate::config::StatePaths;
use crate::discovery;
use crate::error::{Error, Result};
use crate::host::{args, CommandRunner, ProcessReplacer};
use std::path::{Path, PathBuf};

/// Path of the ssh client binary.
pub const SSH_BIN: &str = "/usr/bin/ssh";

/// Path of the key generation utility.
pub const SSH_KEYGEN_BIN: &str = "/usr/bin/ssh-keygen";

/// Permissions for the key directory.
const SSH_DIR_MODE: u32 = 0o700;

/// Ensure an ed25519 keypair exists under the state directory.
///
/// Creates the key directory (0700) if needed. Existing keys are never
/// regenerated or overwritten.
pub fn ensure_keys(paths: &StatePaths, runner: &dyn CommandRunner) -> Result<()> {
    create_key_dir(&paths.ssh_dir())?;

    let key = paths.ssh_key();
    if key.exists() {
        tracing::debug!(path = %key.display(), "ssh key present");
        return Ok(());
    }

    tracing::info!(path = %key.display(), "generating ssh keypair");
    let output = runner.run(SSH_KEYGEN_BIN, &keygen_args(&key))?;
    if !output.is_success() {
        return Err(Error::KeyGeneration(output.code.unwrap_or(-1)));
    }

    Ok(())
}

fn create_key_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(SSH_DIR_MODE)
        .create(dir)?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(SSH_DIR_MODE))?;
    Ok(())
}

fn keygen_args(key: &Path) -> Vec<String> {
    let key = key.to_string_lossy();
    args([
        "-q",
        "-f",
        key.as_ref(),
        "-t",
        "ed25519",
        "-N",
        "",
        "-C",
        SSH_KEY_COMMENT,
    ])
}

/// Interactive ssh session to the guest.
#[derive(Debug, Clone)]
pub struct SshSession {
    paths: StatePaths,
}

impl SshSession {
    /// Session using the keys and recorded address under `paths`.
    pub fn new(paths: StatePaths) -> Self {
        Self { paths }
    }

    /// ssh client arguments for `guest_ip`, followed by `extra`.
    pub fn command_args(&self, guest_ip: &str, extra: &[String]) -> Vec<String> {
        let mut argv = args([
            "-i".to_string(),
            self.paths.ssh_key().to_string_lossy().into_owned(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("UserKnownHostsFile={}", self.paths.known_hosts().display()),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            format!("{}@{}", SSH_USER, guest_ip),
        ]);
        argv.extend(extra.iter().cloned());
        argv
    }

    /// Replace this process with an ssh session to the guest.
    ///
    /// Only returns on failure. The shell's exit code becomes this
    /// process's exit code.
    pub fn connect(&self, extra: &[String], replacer: &dyn ProcessReplacer) -> Result<()> {
        let key = self.paths.ssh_key();
        if !key.exists() {
            return Err(Error::SshKeyNotFound(key));
        }

        let guest_ip = discovery::read_guest_ip(&self.paths.guest_ip())?;
        let argv = self.command_args(&guest_ip, extra);

        tracing::debug!(guest_ip = %guest_ip, "launching ssh");
        Err(Error::SshLaunch(
            replacer.replace(&PathBuf::from(SSH_BIN), &argv),
        ))
    }
}
