//! Serial console capture.
//!
//! By default the guest console is attached straight to the log file. When
//! mirroring is requested the console writes into a pipe instead and a
//! helper thread copies everything to the log and to stderr.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::Path;
use std::thread;

/// Copy `reader` into `log`, and into `mirror` when present, until EOF.
///
/// A failing mirror is dropped and copying to the log continues.
pub fn copy_console<R, L, M>(mut reader: R, mut log: L, mut mirror: Option<M>) -> io::Result<u64>
where
    R: Read,
    L: Write,
    M: Write,
{
    let mut buf = [0u8; 4096];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        log.write_all(&buf[..n])?;
        log.flush()?;

        if let Some(out) = mirror.as_mut() {
            if let Err(e) = out.write_all(&buf[..n]).and_then(|()| out.flush()) {
                tracing::debug!(error = %e, "console mirror closed");
                mirror = None;
            }
        }
        total += n as u64;
    }

    Ok(total)
}

/// Create a pipe for the console. Returns the read end and the write end
/// to hand to the hypervisor.
pub fn console_pipe() -> io::Result<(File, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe(2) just returned two fresh descriptors we now own.
    let (read, write) = unsafe { (File::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((read, write))
}

/// Copy the pipe's read end into `log_path` and stderr on a helper
/// thread. The thread ends when the hypervisor closes the write end.
pub fn spawn_mirror(reader: File, log_path: &Path) -> io::Result<thread::JoinHandle<()>> {
    let log = OpenOptions::new().create(true).append(true).open(log_path)?;

    thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            if let Err(e) = copy_console(reader, log, Some(io::stderr())) {
                tracing::warn!(error = %e, "console capture stopped");
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_copy_to_log_and_mirror() {
        let mut log = Vec::new();
        let mut mirror = Vec::new();
        let n = copy_console(&b"<<< NixOS Stage 1 >>>\n"[..], &mut log, Some(&mut mirror)).unwrap();

        assert_eq!(n, 22);
        assert_eq!(log, b"<<< NixOS Stage 1 >>>\n");
        assert_eq!(mirror, log);
    }

    #[test]
    fn test_broken_mirror_keeps_log() {
        let mut log = Vec::new();
        copy_console(&b"login: "[..], &mut log, Some(Broken)).unwrap();
        assert_eq!(log, b"login: ");
    }

    #[test]
    fn test_pipe_mirror_appends_to_log() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("console.log");
        std::fs::write(&log, "previous boot\n").unwrap();

        let (reader, writer) = console_pipe().unwrap();
        let pump = spawn_mirror(reader, &log).unwrap();

        let mut writer = File::from(writer);
        writer.write_all(b"guest output\n").unwrap();
        drop(writer);
        pump.join().unwrap();

        assert_eq!(
            std::fs::read_to_string(&log).unwrap(),
            "previous boot\nguest output\n"
        );
    }
}
