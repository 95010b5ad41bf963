//! Idle shutdown monitor.
//!
//! Every [`CHECK_INTERVAL`] the monitor asks an [`ActivityProbe`] whether
//! an SSH session to the guest is established. After `timeout_minutes`
//! without one, the idle callback runs once and the monitor ends.

use crate::constants::SSH_PORT;
use crate::discovery;
use crate::host::{args, CommandRunner};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Interval between activity checks. The first check runs one interval
/// after start.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Path of the connection listing utility.
pub const LSOF_BIN: &str = "/usr/bin/lsof";

/// Callback invoked when the idle window elapses.
pub type IdleCallback = Box<dyn FnOnce() + Send + 'static>;

/// Answers whether the guest currently has an interactive session.
pub trait ActivityProbe: Send + Sync {
    /// True if an SSH connection to `guest_ip` is established.
    fn has_active_session(&self, guest_ip: &str) -> bool;
}

/// [`ActivityProbe`] that lists TCP connections with `lsof`.
pub struct LsofProbe {
    runner: Arc<dyn CommandRunner>,
}

impl LsofProbe {
    /// Probe running `lsof` through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl ActivityProbe for LsofProbe {
    fn has_active_session(&self, guest_ip: &str) -> bool {
        let target = format!("@{}:{}", guest_ip, SSH_PORT);
        match self.runner.run(LSOF_BIN, &args(["-i", target.as_str(), "-n", "-P"])) {
            // lsof exits 1 when nothing matches, so only stdout matters.
            Ok(output) => output.stdout.contains("ESTABLISHED"),
            Err(e) => {
                tracing::debug!(error = %e, "connection listing failed");
                false
            }
        }
    }
}

/// Shuts the VM down after a period without SSH activity.
pub struct IdleMonitor {
    timeout_minutes: u32,
    guest_ip_path: PathBuf,
    probe: Arc<dyn ActivityProbe>,
    on_idle: Arc<Mutex<Option<IdleCallback>>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IdleMonitor {
    /// Create a stopped monitor.
    ///
    /// The guest address is re-read from `guest_ip_path` on every check,
    /// so it may be recorded after the monitor starts.
    pub fn new(
        timeout_minutes: u32,
        guest_ip_path: impl Into<PathBuf>,
        probe: Arc<dyn ActivityProbe>,
        on_idle: IdleCallback,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            timeout_minutes,
            guest_ip_path: guest_ip_path.into(),
            probe,
            on_idle: Arc::new(Mutex::new(Some(on_idle))),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Idle window.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_minutes) * 60)
    }

    /// Spawn the check loop on `runtime`.
    ///
    /// Does nothing when the timeout is 0, when already started, or after
    /// [`stop`](Self::stop).
    pub fn start(&self, runtime: &Handle) {
        if self.timeout_minutes == 0 || *self.shutdown_tx.borrow() {
            return;
        }

        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        tracing::info!(timeout_minutes = self.timeout_minutes, "idle monitor started");
        *task = Some(runtime.spawn(run_checks(
            self.timeout(),
            self.guest_ip_path.clone(),
            Arc::clone(&self.probe),
            Arc::clone(&self.on_idle),
            self.shutdown_tx.subscribe(),
        )));
    }

    /// Stop checking. The callback will not run after this returns.
    ///
    /// Idempotent, and safe before [`start`](Self::start).
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        self.on_idle.lock().take();
        if self.task.lock().take().is_some() {
            tracing::debug!("idle monitor stopped");
        }
    }

    /// Whether the check loop is currently spawned and not finished.
    pub fn is_active(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }
}

impl Drop for IdleMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_checks(
    timeout: Duration,
    guest_ip_path: PathBuf,
    probe: Arc<dyn ActivityProbe>,
    on_idle: Arc<Mutex<Option<IdleCallback>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + CHECK_INTERVAL, CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if session_active(&guest_ip_path, &probe).await {
                    last_activity = Instant::now();
                }

                if *shutdown_rx.borrow() {
                    break;
                }

                let idle_for = last_activity.elapsed();
                if idle_for >= timeout {
                    tracing::info!(idle_secs = idle_for.as_secs(), "idle timeout reached");
                    if let Some(callback) = on_idle.lock().take() {
                        callback();
                    }
                    break;
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Sample activity off the async worker. Missing address or probe failure
/// counts as idle.
async fn session_active(guest_ip_path: &Path, probe: &Arc<dyn ActivityProbe>) -> bool {
    let path = guest_ip_path.to_path_buf();
    let probe = Arc::clone(probe);

    tokio::task::spawn_blocking(move || match discovery::read_guest_ip(&path) {
        Ok(ip) => probe.has_active_session(&ip),
        Err(_) => false,
    })
    .await
    .unwrap_or(false)
}
