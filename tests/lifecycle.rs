//! End-to-end orchestrator tests against an in-process fake hypervisor.

use darwin_vz_nix::config::VmConfig;
use darwin_vz_nix::constants::{GUEST_HOSTNAME, SSH_KEYS_TAG};
use darwin_vz_nix::discovery::{self, ARP_BIN};
use darwin_vz_nix::error::ImageKind;
use darwin_vz_nix::host::{CommandOutput, CommandRunner};
use darwin_vz_nix::ssh::SSH_KEYGEN_BIN;
use darwin_vz_nix::vm::manager::Control;
use darwin_vz_nix::vm::{
    emit, EventSink, ExitStatus, Hypervisor, MachineSpec, ResourceLimits, RosettaAvailability,
    VmEvent, VmManager, VmQueue, VmState,
};
use darwin_vz_nix::{pidfile, process, Error, Result};
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

/// What the fake hypervisor saw.
#[derive(Default)]
struct Journal {
    calls: Vec<&'static str>,
    spec: Option<MachineSpec>,
    events: Option<EventSink>,
}

#[derive(Clone, Copy, Default)]
struct Faults {
    start: bool,
    request_stop: bool,
}

struct FakeHypervisor {
    journal: Arc<Mutex<Journal>>,
    faults: Faults,
}

impl Hypervisor for FakeHypervisor {
    fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            min_cpus: 1,
            max_cpus: 8,
            min_memory_bytes: 512 * 1024 * 1024,
            max_memory_bytes: 64 * 1024 * 1024 * 1024,
        }
    }

    fn rosetta_availability(&self) -> RosettaAvailability {
        RosettaAvailability::NotInstalled
    }

    fn create(&mut self, spec: &MachineSpec, events: EventSink) -> Result<()> {
        let mut journal = self.journal.lock();
        journal.calls.push("create");
        journal.spec = Some(spec.clone());
        journal.events = Some(events);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.journal.lock().calls.push("start");
        if self.faults.start {
            return Err(Error::hypervisor("boot failed"));
        }
        Ok(())
    }

    fn request_stop(&mut self) -> Result<()> {
        self.journal.lock().calls.push("request_stop");
        if self.faults.request_stop {
            return Err(Error::hypervisor("guest not responding"));
        }
        Ok(())
    }

    fn release(&mut self) {
        self.journal.lock().calls.push("release");
    }
}

/// Host utilities: writes keys for ssh-keygen, answers arp for the guest.
struct FakeHost {
    arp_reply: String,
    commands: Mutex<Vec<String>>,
}

impl FakeHost {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            arp_reply: "? (192.168.64.9) at 2:da:72:56:0:1 on bridge100 ifscope [ethernet]\n"
                .to_string(),
            commands: Mutex::new(Vec::new()),
        })
    }
}

impl CommandRunner for FakeHost {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        self.commands.lock().push(program.to_string());
        match program {
            SSH_KEYGEN_BIN => {
                let key = &args[2];
                std::fs::write(key, "private")?;
                std::fs::write(format!("{}.pub", key), "public")?;
                Ok(CommandOutput::success(""))
            }
            ARP_BIN => Ok(CommandOutput::success(self.arp_reply.clone())),
            _ => Ok(CommandOutput::failure(1)),
        }
    }
}

struct Fixture {
    dir: TempDir,
    journal: Arc<Mutex<Journal>>,
    host: Arc<FakeHost>,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("kernel"), b"kernel").unwrap();
        std::fs::write(dir.path().join("initrd"), b"initrd").unwrap();
        std::fs::create_dir(dir.path().join("store")).unwrap();
        Self {
            dir,
            journal: Arc::new(Mutex::new(Journal::default())),
            host: FakeHost::new(),
        }
    }

    fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    fn config(&self) -> VmConfig {
        VmConfig::new(self.dir.path().join("kernel"), self.dir.path().join("initrd"))
            .with_disk_size("16M")
            .with_state_dir(self.state_dir())
    }

    fn manager(&self, config: VmConfig, faults: Faults) -> VmManager {
        let journal = Arc::clone(&self.journal);
        let queue = VmQueue::spawn(move || {
            Ok(Box::new(FakeHypervisor { journal, faults }) as Box<dyn Hypervisor>)
        })
        .unwrap();

        let runner: Arc<dyn CommandRunner> = self.host.clone();
        VmManager::new(config, queue, runner)
            .with_nix_store(self.dir.path().join("store"))
            .with_lease_file(self.dir.path().join("dhcpd_leases"))
            .with_discovery_timeout(Duration::from_secs(5))
    }

    fn calls(&self) -> Vec<&'static str> {
        self.journal.lock().calls.clone()
    }

    fn pid_file(&self) -> PathBuf {
        self.state_dir().join("vm.pid")
    }
}

fn write_lease(path: &Path, ip: &str, counter: u64) {
    std::fs::write(
        path,
        format!(
            "{{\n\tname={}\n\tip_address={}\n\thw_address=1,2:da:72:56:0:1\n\tlease=0x{:x}\n}}\n",
            GUEST_HOSTNAME, ip, counter
        ),
    )
    .unwrap();
}

#[test]
fn test_start_then_graceful_stop() {
    let fixture = Fixture::new();
    let manager = fixture.manager(fixture.config(), Faults::default());

    manager.start().unwrap();
    assert_eq!(manager.state(), VmState::Running);
    assert_eq!(fixture.calls(), vec!["create", "start"]);
    assert_eq!(
        pidfile::read_pid(&fixture.pid_file()),
        Some(process::current_pid())
    );

    let disk = std::fs::metadata(fixture.state_dir().join("disk.img")).unwrap();
    assert_eq!(disk.len(), 16 * 1024 * 1024);
    assert!(fixture.state_dir().join("ssh/id_ed25519").exists());

    let spec = fixture.journal.lock().spec.clone().unwrap();
    assert_eq!(spec.cpus, 4);
    assert_eq!(spec.boot.command_line, "console=hvc0 root=/dev/vda");
    let tags: Vec<_> = spec.shares.iter().map(|s| s.tag.clone()).collect();
    assert_eq!(tags, vec!["nix-store".to_string(), SSH_KEYS_TAG.to_string()]);

    manager.stop(false).unwrap();
    assert_eq!(manager.state(), VmState::Stopped);
    assert_eq!(fixture.calls(), vec!["create", "start", "request_stop", "release"]);
    assert!(!fixture.pid_file().exists());
}

#[test]
fn test_force_stop_skips_guest_request() {
    let fixture = Fixture::new();
    let manager = fixture.manager(fixture.config(), Faults::default());

    manager.start().unwrap();
    manager.stop(true).unwrap();

    assert_eq!(fixture.calls(), vec!["create", "start", "release"]);
    assert!(!fixture.pid_file().exists());
    assert!(matches!(manager.stop(true), Err(Error::NotRunning)));
}

#[test]
fn test_missing_kernel_has_no_side_effects() {
    let fixture = Fixture::new();
    let config = VmConfig::new(fixture.dir.path().join("no-kernel"), fixture.dir.path().join("initrd"))
        .with_state_dir(fixture.state_dir());
    let manager = fixture.manager(config, Faults::default());

    match manager.start() {
        Err(Error::ImageNotFound { kind, .. }) => assert_eq!(kind, ImageKind::Kernel),
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }

    assert!(!fixture.state_dir().exists());
    assert!(fixture.calls().is_empty());
    assert!(fixture.host.commands.lock().is_empty());
    assert_eq!(manager.state(), VmState::Stopped);
}

#[test]
fn test_second_start_refused_while_first_alive() {
    let fixture = Fixture::new();
    std::fs::create_dir_all(fixture.state_dir()).unwrap();
    let first = process::current_pid();
    pidfile::write_pid(&fixture.pid_file(), first).unwrap();

    let manager = fixture.manager(fixture.config(), Faults::default());
    match manager.start() {
        Err(Error::AlreadyRunning { pid }) => assert_eq!(pid, first),
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }

    assert_eq!(pidfile::read_pid(&fixture.pid_file()), Some(first));
    assert!(!fixture.state_dir().join("disk.img").exists());
    assert!(!fixture.state_dir().join("ssh").exists());
    assert!(fixture.calls().is_empty());
}

#[test]
fn test_stale_marker_does_not_block_start() {
    let fixture = Fixture::new();
    std::fs::create_dir_all(fixture.state_dir()).unwrap();
    pidfile::write_pid(&fixture.pid_file(), 99999999).unwrap();

    let manager = fixture.manager(fixture.config(), Faults::default());
    manager.start().unwrap();
    assert_eq!(
        pidfile::read_pid(&fixture.pid_file()),
        Some(process::current_pid())
    );
    manager.stop(true).unwrap();
}

#[test]
fn test_hypervisor_start_failure() {
    let fixture = Fixture::new();
    let manager = fixture.manager(
        fixture.config(),
        Faults {
            start: true,
            ..Default::default()
        },
    );

    assert!(matches!(manager.start(), Err(Error::Hypervisor(_))));
    assert_eq!(manager.state(), VmState::Failed);
    assert_eq!(fixture.calls(), vec!["create", "start", "release"]);
    assert!(!fixture.pid_file().exists());
}

#[test]
fn test_signal_triggers_graceful_stop() {
    let fixture = Fixture::new();
    let manager = fixture.manager(fixture.config(), Faults::default());
    manager.start().unwrap();

    manager
        .control_sender()
        .send(Control::Signal(libc::SIGTERM))
        .unwrap();
    assert_eq!(manager.run_until_exit(), ExitStatus::Success);

    assert!(fixture.calls().contains(&"request_stop"));
    assert!(!fixture.pid_file().exists());
    assert_eq!(manager.state(), VmState::Stopped);
}

#[test]
fn test_failed_graceful_stop_still_exits() {
    let fixture = Fixture::new();
    let manager = fixture.manager(
        fixture.config(),
        Faults {
            request_stop: true,
            ..Default::default()
        },
    );
    manager.start().unwrap();

    manager.control_sender().send(Control::IdleTimeout).unwrap();
    assert_eq!(manager.run_until_exit(), ExitStatus::Success);
    assert_eq!(manager.state(), VmState::Failed);
    assert!(!fixture.pid_file().exists());
}

#[test]
fn test_guest_shutdown_callback() {
    let fixture = Fixture::new();
    let manager = fixture.manager(fixture.config(), Faults::default());
    manager.start().unwrap();

    let events = fixture.journal.lock().events.clone().unwrap();
    emit(&events, VmEvent::GuestStopped);

    assert_eq!(manager.run_until_exit(), ExitStatus::Success);
    assert!(!fixture.pid_file().exists());
    assert!(!fixture.calls().contains(&"request_stop"));
}

#[test]
fn test_stopped_with_error_callback() {
    let fixture = Fixture::new();
    let manager = fixture.manager(fixture.config(), Faults::default());
    manager.start().unwrap();

    let events = fixture.journal.lock().events.clone().unwrap();
    emit(&events, VmEvent::StoppedWithError("host sleep".into()));

    assert_eq!(manager.run_until_exit(), ExitStatus::Failure);
    assert_eq!(manager.state(), VmState::Failed);
    assert!(!fixture.pid_file().exists());
}

#[test]
fn test_discovery_after_start() {
    let fixture = Fixture::new();
    let manager = fixture.manager(fixture.config(), Faults::default());
    manager.start().unwrap();

    let now = discovery::lease_counter(SystemTime::now());
    let leases = fixture.dir.path().join("dhcpd_leases");
    write_lease(&leases, "192.168.64.9", now + 60);

    assert_eq!(manager.discover_guest().unwrap(), "192.168.64.9");
    assert_eq!(
        discovery::read_guest_ip(&fixture.state_dir().join("guest-ip")).unwrap(),
        "192.168.64.9"
    );
    manager.stop(true).unwrap();
}

#[test]
fn test_discovery_ignores_leases_from_previous_boot() {
    let fixture = Fixture::new();
    let manager = fixture
        .manager(fixture.config(), Faults::default())
        .with_discovery_timeout(Duration::from_millis(600));
    manager.start().unwrap();

    let before = discovery::lease_counter(SystemTime::now()) - 3600;
    write_lease(&fixture.dir.path().join("dhcpd_leases"), "192.168.64.9", before);

    assert!(matches!(
        manager.discover_guest(),
        Err(Error::GuestIpNotFound)
    ));
    assert!(!fixture.state_dir().join("guest-ip").exists());
    manager.stop(true).unwrap();
}

#[test]
fn test_idle_monitor_started_with_timeout() {
    let fixture = Fixture::new();
    let manager = fixture.manager(fixture.config().with_idle_timeout(5), Faults::default());
    manager.start().unwrap();

    // Stopping cancels the monitor before its first check.
    manager.stop(false).unwrap();
    assert_eq!(manager.state(), VmState::Stopped);
    assert!(!fixture
        .host
        .commands
        .lock()
        .iter()
        .any(|c| c.ends_with("lsof")));
}
