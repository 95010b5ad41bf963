//! Hypervisor backend implementations.
//!
//! Only Virtualization.framework on macOS is supported. Other platforms get
//! a clear error at start instead of a build failure, so the rest of the
//! crate (and its tests) stays portable.

#[cfg(target_os = "macos")]
mod virtualization;

use crate::error::Result;
use crate::vm::Hypervisor;

#[cfg(target_os = "macos")]
pub use virtualization::VirtualizationBackend;

/// Create the default backend for this platform.
///
/// Must be called on the thread that will own the hypervisor (the
/// [`VmQueue`](crate::vm::VmQueue) worker).
pub fn create_default() -> Result<Box<dyn Hypervisor>> {
    #[cfg(target_os = "macos")]
    {
        let backend = VirtualizationBackend::new()?;
        Ok(Box::new(backend))
    }

    #[cfg(not(target_os = "macos"))]
    Err(crate::error::Error::HypervisorUnavailable(
        "Virtualization.framework requires macOS".into(),
    ))
}
