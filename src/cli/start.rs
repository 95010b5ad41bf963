//! Start command implementation.

use super::StateDirArg;
use clap::Args;
use darwin_vz_nix::config::{self, VmConfig};
use darwin_vz_nix::host::{CommandRunner, SystemRunner};
use darwin_vz_nix::settings::{Settings, DEFAULT_DISCOVERY_TIMEOUT};
use darwin_vz_nix::vm::backend;
use darwin_vz_nix::vm::signals::SignalForwarder;
use darwin_vz_nix::vm::{ExitStatus, VmManager, VmQueue};
use darwin_vz_nix::{nix, pidfile};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Boot the VM and stay in the foreground until it stops.
#[derive(Args, Debug)]
pub struct StartCmd {
    /// Number of CPU cores [default: 4]
    #[arg(long)]
    pub cores: Option<u32>,

    /// Memory in MB [default: 8192]
    #[arg(long, value_name = "MB")]
    pub memory: Option<u64>,

    /// Disk size, e.g. 100G or 512M [default: 100G]
    #[arg(long, value_name = "SIZE")]
    pub disk_size: Option<String>,

    /// Path to the kernel image.
    #[arg(long)]
    pub kernel: PathBuf,

    /// Path to the initrd image.
    #[arg(long)]
    pub initrd: PathBuf,

    /// NixOS system toplevel, booted as `init=<system>/init`.
    #[arg(long)]
    pub system: Option<PathBuf>,

    /// Do not expose Rosetta for x86_64 binaries.
    #[arg(long)]
    pub no_rosetta: bool,

    /// Do not share the host /nix/store.
    #[arg(long)]
    pub no_share_nix_store: bool,

    /// Shut down after this many minutes without SSH activity (0 disables) [default: 0]
    #[arg(long, value_name = "MIN")]
    pub idle_timeout: Option<u32>,

    /// How long to wait for the guest address, e.g. 90s or 3m [default: 120s]
    #[arg(long, value_parser = humantime::parse_duration)]
    pub discovery_timeout: Option<Duration>,

    /// Show VM console output on stderr and enable debug logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(flatten)]
    pub state: StateDirArg,
}

impl StartCmd {
    /// Resolve flags over settings into a VM configuration.
    pub fn config(&self, settings: &Settings) -> VmConfig {
        VmConfig::new(&self.kernel, &self.initrd)
            .with_cores(self.cores.or(settings.cores).unwrap_or(config::DEFAULT_CORES))
            .with_memory_mb(
                self.memory
                    .or(settings.memory)
                    .unwrap_or(config::DEFAULT_MEMORY_MB),
            )
            .with_disk_size(
                self.disk_size
                    .clone()
                    .or_else(|| settings.disk_size.clone())
                    .unwrap_or_else(|| config::DEFAULT_DISK_SIZE.to_string()),
            )
            .with_system(self.system.as_ref())
            .with_rosetta(!self.no_rosetta)
            .with_nix_store_share(!self.no_share_nix_store)
            .with_idle_timeout(self.idle_timeout.or(settings.idle_timeout).unwrap_or(0))
            .with_console_to_stderr(self.verbose)
            .with_state_dir(self.state.resolve(settings))
    }

    /// Flag, else the settings file, else the built-in default. A bad
    /// settings value is reported and ignored.
    pub fn discovery_timeout(&self, settings: &Settings) -> Duration {
        if let Some(timeout) = self.discovery_timeout {
            return timeout;
        }
        settings.discovery_timeout().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "ignoring discovery timeout from settings");
            DEFAULT_DISCOVERY_TIMEOUT
        })
    }

    /// Execute the start command.
    pub fn run(self, settings: &Settings) -> darwin_vz_nix::Result<ExitStatus> {
        let config = self.config(settings);

        // Refuse before any setup.
        pidfile::ensure_not_running(&config.paths().pid_file())?;
        config.validate()?;

        let discovery_timeout = self.discovery_timeout(settings);

        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let queue = VmQueue::spawn(backend::create_default)?;
        let manager = Arc::new(
            VmManager::new(config, queue, Arc::clone(&runner))
                .with_discovery_timeout(discovery_timeout),
        );
        let _signals = SignalForwarder::install(manager.control_sender())?;

        nix::clean_stale_lock_files(runner.as_ref());

        let config = manager.config();
        eprintln!(
            "Starting NixOS VM (cores: {}, memory: {}MB, disk: {})...",
            config.cores, config.memory_mb, config.disk_size
        );
        manager.start()?;

        // Discovery runs beside the control loop so a signal is handled
        // without waiting for it.
        let discovering = Arc::clone(&manager);
        std::thread::Builder::new()
            .name("discovery".into())
            .spawn(move || {
                eprintln!("Waiting for guest IP address...");
                match discovering.discover_guest() {
                    Ok(ip) => eprintln!("Guest IP: {}", ip),
                    Err(e) => eprintln!("Warning: Could not discover guest IP: {}", e),
                }
                eprintln!("VM is running. Press Ctrl+C to stop.");
            })?;

        Ok(manager.run_until_exit())
    }
}
