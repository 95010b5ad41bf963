//! Error types for darwin-vz-nix.

use std::path::PathBuf;

/// Result type alias using the crate error.
pub type Result<T> = std::result::Result<T, Error>;

/// Boot artifact kinds checked during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// Linux kernel image.
    Kernel,
    /// Initial ramdisk.
    Initrd,
}

impl std::fmt::Display for ImageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageKind::Kernel => write!(f, "Kernel"),
            ImageKind::Initrd => write!(f, "Initrd"),
        }
    }
}

/// Errors produced by darwin-vz-nix.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// CPU core count below the minimum.
    #[error("invalid CPU core count: {0}. Must be at least 1")]
    InvalidCoreCount(u32),

    /// Memory below the minimum.
    #[error("insufficient memory: {0} MB. Must be at least 512 MB")]
    InsufficientMemory(u64),

    /// A required boot image is missing.
    #[error("{kind} image not found at: {}{}", .path.display(), hint_suffix(.hint))]
    ImageNotFound {
        kind: ImageKind,
        path: PathBuf,
        hint: Option<String>,
    },

    /// Disk size string does not match the size grammar.
    #[error("invalid disk size format: '{0}'. Use format like '100G', '512M', or bytes")]
    InvalidDiskSize(String),

    /// State directory could not be created.
    #[error("failed to create state directory at {}: {source}", .path.display())]
    StateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another instance owns the state directory.
    #[error("a VM is already running (PID: {pid}). Stop it first with 'darwin-vz-nix stop'")]
    AlreadyRunning { pid: i32 },

    /// No live instance exists.
    #[error("no running VM found. Start a VM first with 'darwin-vz-nix start'")]
    NotRunning,

    /// Operation not valid in the current lifecycle state.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Disk image provisioning failed.
    #[error("failed to create disk image: {0}")]
    DiskImage(String),

    /// PID marker could not be written.
    #[error("failed to write PID file: {0}")]
    PidFile(String),

    /// ssh-keygen exited unsuccessfully.
    #[error("SSH key generation failed with exit code: {0}")]
    KeyGeneration(i32),

    /// SSH private key missing.
    #[error("SSH key not found at: {}", .0.display())]
    SshKeyNotFound(PathBuf),

    /// The remote shell could not replace this process.
    #[error("failed to launch ssh: {0}")]
    SshLaunch(#[source] std::io::Error),

    /// Guest address was not discovered or recorded.
    #[error("could not discover guest VM IP address. Is the VM running?")]
    GuestIpNotFound,

    /// A directory share could not be configured.
    #[error("failed to configure shared directory: {0}")]
    SharedDirectory(String),

    /// Rosetta was required but cannot be used.
    #[error("rosetta unavailable: {0}")]
    RosettaUnavailable(String),

    /// The hypervisor rejected a configuration or operation.
    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    /// No hypervisor backend on this host.
    #[error("hypervisor unavailable: {0}")]
    HypervisorUnavailable(String),

    /// The hypervisor queue has shut down.
    #[error("hypervisor queue is closed")]
    QueueClosed,

    /// Delivering a signal to the VM process failed.
    #[error("failed to send signal to PID {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: std::io::Error,
    },

    /// Settings file could not be loaded.
    #[error("failed to load settings: {0}")]
    SettingsLoad(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn hint_suffix(hint: &Option<String>) -> String {
    hint.as_deref()
        .map(|h| format!(" ({})", h))
        .unwrap_or_default()
}

impl Error {
    /// Create a hypervisor error from any message.
    pub fn hypervisor(msg: impl Into<String>) -> Self {
        Error::Hypervisor(msg.into())
    }

    /// Create a disk image error from any message.
    pub fn disk_image(msg: impl Into<String>) -> Self {
        Error::DiskImage(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl std::fmt::Display) -> Self {
        Error::InvalidState {
            expected: expected.into(),
            actual: actual.to_string(),
        }
    }
}
