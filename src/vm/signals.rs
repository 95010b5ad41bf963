//! Termination signal interception.
//!
//! SIGINT and SIGTERM are taken over from their default disposition and
//! forwarded to the orchestrator's control channel. Only the first signal
//! is forwarded; later ones are logged and ignored while the graceful stop
//! runs.

use super::manager::Control;
use crate::error::Result;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::sync::mpsc;
use std::thread;

/// Human-readable signal name.
pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        _ => "signal",
    }
}

/// Background signal listener.
pub struct SignalForwarder {
    handle: Handle,
    thread: Option<thread::JoinHandle<()>>,
}

impl SignalForwarder {
    /// Install handlers and forward the first termination signal to `control`.
    pub fn install(control: mpsc::Sender<Control>) -> Result<Self> {
        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let handle = signals.handle();

        let thread = thread::Builder::new()
            .name("signals".into())
            .spawn(move || {
                let mut forwarded = false;
                for signal in signals.forever() {
                    if forwarded {
                        tracing::warn!(signal = signal_name(signal), "shutdown already in progress");
                        continue;
                    }
                    forwarded = true;
                    tracing::info!(signal = signal_name(signal), "received signal");
                    if control.send(Control::Signal(signal)).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }
}

impl Drop for SignalForwarder {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(SIGINT), "SIGINT");
        assert_eq!(signal_name(SIGTERM), "SIGTERM");
        assert_eq!(signal_name(libc::SIGHUP), "signal");
    }

    #[test]
    fn test_first_signal_forwarded_once() {
        let (tx, rx) = mpsc::channel();
        let forwarder = SignalForwarder::install(tx).unwrap();

        signal_hook::low_level::raise(SIGTERM).unwrap();
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(first, Control::Signal(SIGTERM)));

        signal_hook::low_level::raise(SIGINT).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        drop(forwarder);
    }
}
