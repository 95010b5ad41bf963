//! Guest disk image provisioning.
//!
//! The guest root device is a sparse raw image in the state directory. It
//! is created zero-filled on first start and reused afterwards; formatting
//! happens inside the guest.

use crate::error::{Error, Result};
use std::path::Path;

/// Ensure a sparse disk image of `size_bytes` exists at `path`.
///
/// Returns true if a new image was created. An existing image is left
/// untouched regardless of its size. If creation fails part way, the
/// partial file is removed before the error is returned.
pub fn ensure_disk_image(path: &Path, size_bytes: u64) -> Result<bool> {
    if path.exists() {
        tracing::debug!(path = %path.display(), "disk image present");
        return Ok(false);
    }

    if size_bytes == 0 {
        return Err(Error::disk_image("disk size must be greater than 0"));
    }

    tracing::info!(
        path = %path.display(),
        size_gb = size_bytes / (1024 * 1024 * 1024),
        "creating sparse disk image"
    );

    if let Err(e) = create_sparse_disk(path, size_bytes) {
        if let Err(cleanup) = std::fs::remove_file(path) {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %cleanup, "failed to remove partial disk image");
            }
        }
        return Err(Error::disk_image(format!("{}: {}", path.display(), e)));
    }

    Ok(true)
}

/// Create a sparse file whose last byte is written so the size sticks.
fn create_sparse_disk(path: &Path, size_bytes: u64) -> std::io::Result<()> {
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};

    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.seek(SeekFrom::Start(size_bytes - 1))?;
    file.write_all(&[0])?;
    file.sync_all()?;
    Ok(())
}
