//! VM abstraction layer.
//!
//! [`MachineSpec`] is the platform-neutral description of the guest built
//! from a validated [`VmConfig`]. A [`Hypervisor`] turns it into a running
//! machine. Hypervisor objects are not thread-safe, so every call goes
//! through the single-worker [`VmQueue`].

pub mod backend;
pub mod console;
pub mod manager;
pub mod queue;
pub mod signals;

pub use manager::{ExitStatus, VmManager};
pub use queue::VmQueue;

use crate::config::VmConfig;
use crate::constants::{
    GUEST_MAC_ADDRESS, NIX_STORE_PATH, NIX_STORE_TAG, ROSETTA_TAG, SSH_KEYS_TAG,
};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::mpsc;

/// Lifecycle state of the orchestrated VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// No hypervisor handle.
    Stopped,
    /// Provisioning and booting.
    Starting,
    /// Guest booted.
    Running,
    /// Graceful stop in progress.
    Stopping,
    /// Unrecoverable hypervisor error.
    Failed,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Stopped => write!(f, "stopped"),
            VmState::Starting => write!(f, "starting"),
            VmState::Running => write!(f, "running"),
            VmState::Stopping => write!(f, "stopping"),
            VmState::Failed => write!(f, "failed"),
        }
    }
}

/// CPU and memory bounds accepted by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub min_cpus: u32,
    pub max_cpus: u32,
    pub min_memory_bytes: u64,
    pub max_memory_bytes: u64,
}

/// Host support for the Rosetta translation share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosettaAvailability {
    /// Installed and usable.
    Installed,
    /// Supported but not installed.
    NotInstalled,
    /// Not supported on this host (Intel Macs).
    NotSupported,
}

/// Linux direct boot parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootParams {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub command_line: String,
}

/// Source of serial console input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleInput {
    /// The controlling terminal.
    Terminal,
    /// `/dev/null`.
    Null,
}

/// Serial console wiring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleSpec {
    /// File receiving console output.
    pub log: PathBuf,
    pub input: ConsoleInput,
    /// Also copy console output to stderr.
    pub mirror_to_stderr: bool,
}

/// What a VirtioFS device exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareSource {
    /// A host directory.
    Host { path: PathBuf, read_only: bool },
    /// The Rosetta runtime.
    Rosetta,
}

/// A VirtioFS device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryShare {
    /// Mount tag seen by the guest.
    pub tag: String,
    pub source: ShareSource,
}

impl DirectoryShare {
    fn host(tag: &str, path: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            tag: tag.to_string(),
            source: ShareSource::Host {
                path: path.into(),
                read_only,
            },
        }
    }
}

/// Host facts that shape the machine description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEnvironment {
    pub limits: ResourceLimits,
    pub rosetta: RosettaAvailability,
    pub console_input: ConsoleInput,
    /// Location of the host package store.
    pub nix_store: PathBuf,
}

impl HostEnvironment {
    /// Query the hypervisor and the controlling terminal.
    pub fn detect(hypervisor: &dyn Hypervisor) -> Self {
        Self {
            limits: hypervisor.limits(),
            rosetta: hypervisor.rosetta_availability(),
            console_input: if crate::host::stdin_is_tty() {
                ConsoleInput::Terminal
            } else {
                ConsoleInput::Null
            },
            nix_store: PathBuf::from(NIX_STORE_PATH),
        }
    }
}

/// Complete guest description handed to a [`Hypervisor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSpec {
    pub boot: BootParams,
    pub cpus: u32,
    pub memory_bytes: u64,
    /// Raw disk image attached read-write as the root block device.
    pub disk_image: PathBuf,
    /// MAC of the single NAT network device.
    pub mac_address: String,
    pub console: ConsoleSpec,
    /// Attach a virtio entropy device.
    pub entropy: bool,
    pub shares: Vec<DirectoryShare>,
}

impl MachineSpec {
    /// Build the guest description for `config` on `host`.
    ///
    /// CPU and memory are clamped to the hypervisor limits. Fails if the
    /// package store share is enabled but the store does not exist.
    pub fn build(config: &VmConfig, host: &HostEnvironment) -> Result<Self> {
        let paths = config.paths();

        let mut shares = Vec::new();
        if config.share_nix_store {
            if !host.nix_store.is_dir() {
                return Err(Error::SharedDirectory(format!(
                    "{} not found. Is Nix installed?",
                    host.nix_store.display()
                )));
            }
            shares.push(DirectoryShare::host(NIX_STORE_TAG, &host.nix_store, true));
        }
        if config.rosetta {
            shares.extend(rosetta_share(host.rosetta, false)?);
        }
        shares.push(DirectoryShare::host(SSH_KEYS_TAG, paths.ssh_dir(), true));

        Ok(Self {
            boot: BootParams {
                kernel: config.kernel.clone(),
                initrd: config.initrd.clone(),
                command_line: kernel_command_line(config.system.as_deref()),
            },
            cpus: clamp_cpus(config.cores, &host.limits),
            memory_bytes: clamp_memory(config.memory_mb, &host.limits),
            disk_image: paths.disk_image(),
            mac_address: GUEST_MAC_ADDRESS.to_string(),
            console: ConsoleSpec {
                log: paths.console_log(),
                input: host.console_input,
                mirror_to_stderr: config.console_to_stderr,
            },
            entropy: true,
            shares,
        })
    }
}

/// Kernel command line, booting `<system>/init` when a system is given.
pub fn kernel_command_line(system: Option<&Path>) -> String {
    let mut cmdline = String::from("console=hvc0 root=/dev/vda");
    if let Some(system) = system {
        cmdline.push_str(&format!(" init={}/init", system.display()));
    }
    cmdline
}

fn clamp_cpus(cores: u32, limits: &ResourceLimits) -> u32 {
    cores.min(limits.max_cpus).max(limits.min_cpus)
}

fn clamp_memory(memory_mb: u64, limits: &ResourceLimits) -> u64 {
    memory_mb
        .saturating_mul(1024 * 1024)
        .min(limits.max_memory_bytes)
        .max(limits.min_memory_bytes)
}

/// Rosetta share for `availability`.
///
/// When not `required`, an unusable Rosetta only logs a warning and yields
/// no share.
pub fn rosetta_share(
    availability: RosettaAvailability,
    required: bool,
) -> Result<Option<DirectoryShare>> {
    match availability {
        RosettaAvailability::Installed => Ok(Some(DirectoryShare {
            tag: ROSETTA_TAG.to_string(),
            source: ShareSource::Rosetta,
        })),
        RosettaAvailability::NotSupported => {
            if required {
                return Err(Error::RosettaUnavailable(
                    "not available on this platform (requires Apple Silicon)".into(),
                ));
            }
            tracing::warn!("Rosetta is not supported on this platform; x86_64 builds will not be available");
            Ok(None)
        }
        RosettaAvailability::NotInstalled => {
            if required {
                return Err(Error::RosettaUnavailable(
                    "not installed. Install with: softwareupdate --install-rosetta".into(),
                ));
            }
            tracing::warn!(
                "Rosetta is not installed; x86_64 builds will not be available. Install with: softwareupdate --install-rosetta"
            );
            Ok(None)
        }
    }
}

/// Asynchronous notifications from a running machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmEvent {
    /// The guest shut itself down.
    GuestStopped,
    /// The machine stopped because of an error.
    StoppedWithError(String),
}

/// Delivers [`VmEvent`]s to the orchestrator.
pub type EventSink = mpsc::Sender<manager::Control>;

/// Send `event` to `sink`, ignoring a closed receiver.
pub fn emit(sink: &EventSink, event: VmEvent) {
    if sink.send(manager::Control::Vm(event)).is_err() {
        tracing::debug!("vm event dropped, orchestrator gone");
    }
}

/// A hypervisor able to run one machine.
///
/// Implementations are not required to be thread-safe. They are created
/// on, and only ever called from, the [`VmQueue`] worker.
pub trait Hypervisor {
    /// Allowed CPU and memory range.
    fn limits(&self) -> ResourceLimits;

    /// Whether the Rosetta share can be offered.
    fn rosetta_availability(&self) -> RosettaAvailability;

    /// Validate `spec` and construct the machine. Lifecycle callbacks are
    /// delivered to `events`.
    fn create(&mut self, spec: &MachineSpec, events: EventSink) -> Result<()>;

    /// Boot the machine, returning once the start completes.
    fn start(&mut self) -> Result<()>;

    /// Ask the guest to shut down (ACPI power button).
    fn request_stop(&mut self) -> Result<()>;

    /// Drop the machine handle.
    fn release(&mut self);
}
