//! darwin-vz-nix: run a NixOS builder VM on macOS.
//!
//! The library owns the VM lifecycle: configuration and validation, the
//! per-state-directory singleton, startup orchestration on a dedicated
//! hypervisor queue, guest address discovery, idle shutdown and
//! signal-driven stop. The `darwin-vz-nix` binary is a thin CLI over it.

pub mod config;
pub mod constants;
pub mod discovery;
pub mod error;
pub mod host;
pub mod idle;
pub mod nix;
pub mod pidfile;
pub mod process;
pub mod settings;
pub mod ssh;
pub mod storage;
pub mod vm;

pub use config::{StatePaths, VmConfig};
pub use error::{Error, Result};
pub use vm::{VmManager, VmQueue, VmState};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
