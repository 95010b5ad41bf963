//! VM lifecycle orchestrator.
//!
//! [`VmManager`] owns the hypervisor (through its [`VmQueue`]), the
//! singleton marker and the idle monitor. After a successful start the
//! caller parks in [`VmManager::run_until_exit`], which sleeps on the
//! control channel until a signal, the idle monitor or the hypervisor
//! ends the session.

use super::{emit, HostEnvironment, MachineSpec, VmEvent, VmQueue, VmState};
use crate::config::{StatePaths, VmConfig};
use crate::constants::{DHCP_LEASES_PATH, NIX_STORE_PATH};
use crate::discovery::{self, GuestDiscovery};
use crate::error::{Error, Result};
use crate::host::CommandRunner;
use crate::idle::{ActivityProbe, IdleMonitor, LsofProbe};
use crate::settings::DEFAULT_DISCOVERY_TIMEOUT;
use crate::{pidfile, process, ssh, storage};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::{Duration, SystemTime};

/// Messages that wake the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// A termination signal was received.
    Signal(i32),
    /// The idle window elapsed.
    IdleTimeout,
    /// The hypervisor reported a lifecycle change.
    Vm(VmEvent),
}

/// How the orchestrated session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
}

impl ExitStatus {
    /// Process exit code.
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failure => 1,
        }
    }
}

/// Lifecycle orchestrator for one VM.
pub struct VmManager {
    config: VmConfig,
    paths: StatePaths,
    queue: VmQueue,
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn ActivityProbe>,
    lease_file: PathBuf,
    nix_store: PathBuf,
    discovery_timeout: Duration,
    state: Mutex<VmState>,
    started_at: Mutex<Option<SystemTime>>,
    idle: Mutex<Option<IdleMonitor>>,
    control_tx: mpsc::Sender<Control>,
    control_rx: Mutex<Option<mpsc::Receiver<Control>>>,
}

impl VmManager {
    /// Create an orchestrator for `config` driving the hypervisor on `queue`.
    ///
    /// `runner` executes host utilities (key generation, ARP, lsof).
    pub fn new(config: VmConfig, queue: VmQueue, runner: Arc<dyn CommandRunner>) -> Self {
        let (control_tx, control_rx) = mpsc::channel();
        let probe: Arc<dyn ActivityProbe> = Arc::new(LsofProbe::new(Arc::clone(&runner)));

        Self {
            paths: config.paths(),
            config,
            queue,
            runner,
            probe,
            lease_file: PathBuf::from(DHCP_LEASES_PATH),
            nix_store: PathBuf::from(NIX_STORE_PATH),
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            state: Mutex::new(VmState::Stopped),
            started_at: Mutex::new(None),
            idle: Mutex::new(None),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
        }
    }

    /// Use `probe` for idle detection.
    pub fn with_activity_probe(mut self, probe: Arc<dyn ActivityProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Read DHCP leases from `path`.
    pub fn with_lease_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lease_file = path.into();
        self
    }

    /// Share the package store found at `path`.
    pub fn with_nix_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.nix_store = path.into();
        self
    }

    /// Give up guest discovery after `timeout`.
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> VmState {
        *self.state.lock()
    }

    /// The configuration this orchestrator was built with.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// State directory locations.
    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    /// Sender for injecting control messages (signals).
    pub fn control_sender(&self) -> mpsc::Sender<Control> {
        self.control_tx.clone()
    }

    /// Boot the VM.
    ///
    /// Refuses before touching anything if another live instance owns the
    /// state directory or the configuration is invalid. Returns once the
    /// hypervisor reports the machine started.
    pub fn start(&self) -> Result<()> {
        {
            let state = self.state.lock();
            if *state != VmState::Stopped {
                return Err(Error::invalid_state("stopped", *state));
            }
        }

        pidfile::ensure_not_running(&self.paths.pid_file())?;
        self.config.validate()?;

        self.set_state(VmState::Starting);
        *self.started_at.lock() = Some(SystemTime::now());

        if let Err(e) = self.boot() {
            tracing::error!(error = %e, "vm start failed");
            self.abort_start(&e);
            return Err(e);
        }

        self.set_state(VmState::Running);
        tracing::info!(
            cores = self.config.cores,
            memory_mb = self.config.memory_mb,
            "vm running"
        );

        if self.config.idle_timeout_minutes > 0 {
            self.start_idle_monitor();
        }

        Ok(())
    }

    fn boot(&self) -> Result<()> {
        self.config.ensure_state_directory()?;
        ssh::ensure_keys(&self.paths, self.runner.as_ref())?;
        storage::ensure_disk_image(&self.paths.disk_image(), self.config.disk_size_bytes()?)?;

        let mut host = self.queue.call(|hv| Ok(HostEnvironment::detect(&*hv)))?;
        host.nix_store = self.nix_store.clone();
        let spec = MachineSpec::build(&self.config, &host)?;
        tracing::debug!(?spec, "machine spec");

        let events = self.control_tx.clone();
        self.queue.call(move |hv| hv.create(&spec, events))?;

        pidfile::write_pid(&self.paths.pid_file(), process::current_pid())?;

        self.queue.call(|hv| hv.start())
    }

    fn abort_start(&self, error: &Error) {
        if let Err(e) = self.queue.call(|hv| {
            hv.release();
            Ok(())
        }) {
            tracing::debug!(error = %e, "release after failed start");
        }
        pidfile::remove_pid(&self.paths.pid_file());

        let next = if matches!(error, Error::Hypervisor(_)) {
            VmState::Failed
        } else {
            VmState::Stopped
        };
        self.set_state(next);
    }

    /// Stop the VM.
    ///
    /// Forced: drop the handle and the singleton marker immediately.
    /// Graceful: ask the guest to power off, then do the same. A failed
    /// stop request leaves the orchestrator in [`VmState::Failed`].
    pub fn stop(&self, force: bool) -> Result<()> {
        let state = self.state();
        match state {
            VmState::Running => {}
            VmState::Stopped => return Err(Error::NotRunning),
            other => return Err(Error::invalid_state("running", other)),
        }

        self.stop_idle_monitor();

        if force {
            tracing::info!("force stopping vm");
            self.release();
            return Ok(());
        }

        tracing::info!("requesting guest shutdown");
        self.set_state(VmState::Stopping);
        if let Err(e) = self.queue.call(|hv| hv.request_stop()) {
            self.set_state(VmState::Failed);
            return Err(e);
        }

        self.release();
        Ok(())
    }

    fn release(&self) {
        if let Err(e) = self.queue.call(|hv| {
            hv.release();
            Ok(())
        }) {
            tracing::warn!(error = %e, "failed to release vm handle");
        }
        pidfile::remove_pid(&self.paths.pid_file());
        self.set_state(VmState::Stopped);
    }

    /// Wait for the guest address and record it.
    ///
    /// Only leases issued after this orchestrator started are considered.
    pub fn discover_guest(&self) -> Result<String> {
        let started = self.started_at.lock().unwrap_or_else(SystemTime::now);
        let not_before = discovery::lease_counter(started);

        GuestDiscovery::new(self.runner.as_ref())
            .with_lease_file(&self.lease_file)
            .with_timeout(self.discovery_timeout)
            .discover_and_record(not_before, &self.paths.guest_ip())
    }

    /// Block until the session ends and report how.
    ///
    /// The singleton marker is gone on every return path.
    pub fn run_until_exit(&self) -> ExitStatus {
        let Some(control) = self.control_rx.lock().take() else {
            tracing::error!("run_until_exit called twice");
            return ExitStatus::Failure;
        };

        let status = loop {
            let message = match control.recv() {
                Ok(message) => message,
                Err(_) => break ExitStatus::Failure,
            };

            match message {
                Control::Signal(signal) => {
                    tracing::info!(
                        signal = super::signals::signal_name(signal),
                        "shutting down vm"
                    );
                    self.shutdown_gracefully();
                    break ExitStatus::Success;
                }
                Control::IdleTimeout => {
                    tracing::warn!(
                        minutes = self.config.idle_timeout_minutes,
                        "vm idle, shutting down automatically"
                    );
                    self.shutdown_gracefully();
                    break ExitStatus::Success;
                }
                Control::Vm(VmEvent::GuestStopped) => {
                    tracing::info!("guest has stopped");
                    self.stop_idle_monitor();
                    self.set_state(VmState::Stopped);
                    break ExitStatus::Success;
                }
                Control::Vm(VmEvent::StoppedWithError(reason)) => {
                    tracing::error!(reason = %reason, "vm stopped with error");
                    self.stop_idle_monitor();
                    self.set_state(VmState::Failed);
                    break ExitStatus::Failure;
                }
            }
        };

        pidfile::remove_pid(&self.paths.pid_file());
        status
    }

    fn shutdown_gracefully(&self) {
        if let Err(e) = self.stop(false) {
            tracing::warn!(error = %e, "graceful shutdown failed");
        }
    }

    fn start_idle_monitor(&self) {
        let control = self.control_tx.clone();
        let monitor = IdleMonitor::new(
            self.config.idle_timeout_minutes,
            self.paths.guest_ip(),
            Arc::clone(&self.probe),
            Box::new(move || {
                let _ = control.send(Control::IdleTimeout);
            }),
        );
        monitor.start(self.queue.handle());
        *self.idle.lock() = Some(monitor);
    }

    fn stop_idle_monitor(&self) {
        if let Some(monitor) = self.idle.lock().take() {
            monitor.stop();
        }
    }

    fn set_state(&self, next: VmState) {
        let mut state = self.state.lock();
        let previous = *state;
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "vm state");
            *state = next;
        }
    }

    /// Forward a hypervisor event as if the backend had emitted it.
    pub fn notify(&self, event: VmEvent) {
        emit(&self.control_tx, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::CommandOutput;
    use crate::vm::{EventSink, Hypervisor, ResourceLimits, RosettaAvailability};
    use std::io;
    use tempfile::TempDir;

    struct Idle;

    impl Hypervisor for Idle {
        fn limits(&self) -> ResourceLimits {
            ResourceLimits {
                min_cpus: 1,
                max_cpus: 4,
                min_memory_bytes: 0,
                max_memory_bytes: u64::MAX,
            }
        }
        fn rosetta_availability(&self) -> RosettaAvailability {
            RosettaAvailability::NotSupported
        }
        fn create(&mut self, _spec: &MachineSpec, _events: EventSink) -> Result<()> {
            Ok(())
        }
        fn start(&mut self) -> Result<()> {
            Ok(())
        }
        fn request_stop(&mut self) -> Result<()> {
            Ok(())
        }
        fn release(&mut self) {}
    }

    struct NoCommands;

    impl CommandRunner for NoCommands {
        fn run(&self, _program: &str, _args: &[String]) -> io::Result<CommandOutput> {
            Err(io::Error::new(io::ErrorKind::NotFound, "disabled"))
        }
    }

    fn manager(dir: &TempDir) -> VmManager {
        let config = VmConfig::new(dir.path().join("kernel"), dir.path().join("initrd"))
            .with_state_dir(dir.path().join("state"));
        let queue = VmQueue::spawn(|| Ok(Box::new(Idle) as Box<dyn Hypervisor>)).unwrap();
        VmManager::new(config, queue, Arc::new(NoCommands))
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitStatus::Success.code(), 0);
        assert_eq!(ExitStatus::Failure.code(), 1);
    }

    #[test]
    fn test_stop_when_not_started() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        assert!(matches!(manager.stop(false), Err(Error::NotRunning)));
        assert!(matches!(manager.stop(true), Err(Error::NotRunning)));
        assert_eq!(manager.state(), VmState::Stopped);
    }

    #[test]
    fn test_guest_stop_event_ends_session() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.notify(VmEvent::GuestStopped);
        assert_eq!(manager.run_until_exit(), ExitStatus::Success);
        assert_eq!(manager.run_until_exit(), ExitStatus::Failure);
    }

    #[test]
    fn test_error_event_fails_session() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        std::fs::create_dir_all(manager.paths().root()).unwrap();
        pidfile::write_pid(&manager.paths().pid_file(), process::current_pid()).unwrap();

        manager.notify(VmEvent::StoppedWithError("boom".into()));
        assert_eq!(manager.run_until_exit(), ExitStatus::Failure);
        assert_eq!(manager.state(), VmState::Failed);
        assert!(!manager.paths().pid_file().exists());
    }
}
