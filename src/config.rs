//! VM configuration and validation.
//!
//! [`VmConfig`] is built once from the resolved command-line flags,
//! validated, and never mutated afterwards. All on-disk locations are
//! derived from the state directory through [`StatePaths`].

use crate::error::{Error, ImageKind, Result};
use std::path::{Path, PathBuf};

/// Application name used for the state and settings directories.
pub const APP_NAME: &str = "darwin-vz-nix";

/// Default number of vCPUs.
pub const DEFAULT_CORES: u32 = 4;

/// Default memory in MB.
pub const DEFAULT_MEMORY_MB: u64 = 8192;

/// Default sparse disk size.
pub const DEFAULT_DISK_SIZE: &str = "100G";

/// Smallest memory size the guest can boot with, in MB.
pub const MIN_MEMORY_MB: u64 = 512;

/// Permissions for the state directory.
const STATE_DIR_MODE: u32 = 0o700;

/// Default state directory: `~/.local/share/darwin-vz-nix`.
pub fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .unwrap_or_else(|| PathBuf::from(format!(".{}", APP_NAME)))
}

/// Locations inside a state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    /// Paths rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The state directory itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sparse disk image attached as the guest root device.
    pub fn disk_image(&self) -> PathBuf {
        self.root.join("disk.img")
    }

    /// Singleton marker holding the orchestrator PID.
    pub fn pid_file(&self) -> PathBuf {
        self.root.join("vm.pid")
    }

    /// Serial console capture.
    pub fn console_log(&self) -> PathBuf {
        self.root.join("console.log")
    }

    /// Last verified guest address.
    pub fn guest_ip(&self) -> PathBuf {
        self.root.join("guest-ip")
    }

    /// Directory holding the SSH keypair, shared read-only into the guest.
    pub fn ssh_dir(&self) -> PathBuf {
        self.root.join("ssh")
    }

    /// SSH private key.
    pub fn ssh_key(&self) -> PathBuf {
        self.ssh_dir().join("id_ed25519")
    }

    /// SSH public key.
    pub fn ssh_public_key(&self) -> PathBuf {
        self.ssh_dir().join("id_ed25519.pub")
    }

    /// known_hosts file managed by the ssh client.
    pub fn known_hosts(&self) -> PathBuf {
        self.ssh_dir().join("known_hosts")
    }
}

/// Validated-once VM configuration.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Number of vCPUs.
    pub cores: u32,
    /// Memory in MB.
    pub memory_mb: u64,
    /// Disk size in size notation (`100G`, `512M`, raw bytes).
    pub disk_size: String,
    /// Kernel image.
    pub kernel: PathBuf,
    /// Initial ramdisk.
    pub initrd: PathBuf,
    /// NixOS system toplevel, passed as `init=<system>/init`.
    pub system: Option<PathBuf>,
    /// Expose Rosetta for x86_64 binaries.
    pub rosetta: bool,
    /// Share the host `/nix/store` read-only.
    pub share_nix_store: bool,
    /// Minutes without SSH activity before shutdown. 0 disables.
    pub idle_timeout_minutes: u32,
    /// Copy guest console output to stderr as well as the console log.
    pub console_to_stderr: bool,
    /// Root of all persisted state.
    pub state_dir: PathBuf,
}

impl VmConfig {
    /// Create a configuration with default resources for the given boot images.
    ///
    /// Image paths are symlink-resolved where they exist.
    pub fn new(kernel: impl AsRef<Path>, initrd: impl AsRef<Path>) -> Self {
        Self {
            cores: DEFAULT_CORES,
            memory_mb: DEFAULT_MEMORY_MB,
            disk_size: DEFAULT_DISK_SIZE.to_string(),
            kernel: resolve_symlinks(kernel.as_ref()),
            initrd: resolve_symlinks(initrd.as_ref()),
            system: None,
            rosetta: true,
            share_nix_store: true,
            idle_timeout_minutes: 0,
            console_to_stderr: false,
            state_dir: default_state_dir(),
        }
    }

    /// Set the vCPU count.
    pub fn with_cores(mut self, cores: u32) -> Self {
        self.cores = cores;
        self
    }

    /// Set memory in MB.
    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    /// Set the disk size string.
    pub fn with_disk_size(mut self, size: impl Into<String>) -> Self {
        self.disk_size = size.into();
        self
    }

    /// Set the NixOS system toplevel.
    pub fn with_system(mut self, system: Option<impl AsRef<Path>>) -> Self {
        self.system = system.map(|p| resolve_symlinks(p.as_ref()));
        self
    }

    /// Enable or disable the Rosetta share.
    pub fn with_rosetta(mut self, enabled: bool) -> Self {
        self.rosetta = enabled;
        self
    }

    /// Enable or disable the `/nix/store` share.
    pub fn with_nix_store_share(mut self, enabled: bool) -> Self {
        self.share_nix_store = enabled;
        self
    }

    /// Set the idle timeout in minutes.
    pub fn with_idle_timeout(mut self, minutes: u32) -> Self {
        self.idle_timeout_minutes = minutes;
        self
    }

    /// Mirror the serial console to stderr.
    pub fn with_console_to_stderr(mut self, enabled: bool) -> Self {
        self.console_to_stderr = enabled;
        self
    }

    /// Set the state directory.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Derived state locations.
    pub fn paths(&self) -> StatePaths {
        StatePaths::new(&self.state_dir)
    }

    /// Disk size in bytes.
    pub fn disk_size_bytes(&self) -> Result<u64> {
        parse_disk_size(&self.disk_size)
    }

    /// Validate resources and boot images. Touches nothing on disk.
    pub fn validate(&self) -> Result<()> {
        if self.cores < 1 {
            return Err(Error::InvalidCoreCount(self.cores));
        }

        if self.memory_mb < MIN_MEMORY_MB {
            return Err(Error::InsufficientMemory(self.memory_mb));
        }

        check_image(ImageKind::Kernel, &self.kernel)?;
        check_image(ImageKind::Initrd, &self.initrd)?;

        parse_disk_size(&self.disk_size)?;
        Ok(())
    }

    /// Create the state directory with owner-only permissions if absent.
    pub fn ensure_state_directory(&self) -> Result<()> {
        ensure_state_directory(&self.state_dir)
    }
}

/// Create `dir` (and parents) with owner-only permissions. Idempotent.
pub fn ensure_state_directory(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    if dir.is_dir() {
        return Ok(());
    }

    tracing::debug!(path = %dir.display(), "creating state directory");
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(STATE_DIR_MODE)
        .create(dir)
        .map_err(|source| Error::StateDirectory {
            path: dir.to_path_buf(),
            source,
        })
}

/// Parse a disk size such as `100G`, `512m` or `1048576`.
///
/// An optional trailing `T`, `G`, `M` or `K` (any case) multiplies by the
/// matching power of 1024. The numeric part must be a non-empty run of
/// ASCII digits and the result must be greater than zero.
pub fn parse_disk_size(size: &str) -> Result<u64> {
    let invalid = || Error::InvalidDiskSize(size.to_string());

    let trimmed = size.trim();
    let last = trimmed.chars().last().ok_or_else(invalid)?;

    let (digits, multiplier) = match last.to_ascii_uppercase() {
        'T' => (&trimmed[..trimmed.len() - 1], 1u64 << 40),
        'G' => (&trimmed[..trimmed.len() - 1], 1u64 << 30),
        'M' => (&trimmed[..trimmed.len() - 1], 1u64 << 20),
        'K' => (&trimmed[..trimmed.len() - 1], 1u64 << 10),
        _ => (trimmed, 1),
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let value: u64 = digits.parse().map_err(|_| invalid())?;
    if value == 0 {
        return Err(invalid());
    }

    value.checked_mul(multiplier).ok_or_else(invalid)
}

fn resolve_symlinks(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn check_image(kind: ImageKind, path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }

    Err(Error::ImageNotFound {
        kind,
        path: path.to_path_buf(),
        hint: swapped_image_hint(kind, path),
    })
}

/// Nix build outputs place `kernel` and `initrd` side by side. When the
/// requested artifact is missing but its counterpart sits at the same
/// location, the operator most likely passed the wrong output.
fn swapped_image_hint(kind: ImageKind, path: &Path) -> Option<String> {
    let candidates: &[&str] = match kind {
        ImageKind::Kernel => &["initrd"],
        ImageKind::Initrd => &["kernel", "bzImage", "Image"],
    };

    let dir = path.parent()?;
    let found = candidates
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())?;

    let other = match kind {
        ImageKind::Kernel => "initrd",
        ImageKind::Initrd => "kernel",
    };
    Some(format!(
        "found a {} at {}; check whether --kernel and --initrd outputs were swapped",
        other,
        found.display()
    ))
}
