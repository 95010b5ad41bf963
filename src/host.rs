//! Host utility invocation.
//!
//! Two distinct ways of running an external program:
//! - [`CommandRunner`] runs it as a child, captures stdout and returns.
//! - [`ProcessReplacer`] replaces the current process image and only
//!   returns on failure. Used for the interactive ssh session so that the
//!   shell inherits terminal control.

use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if terminated by a signal.
    pub code: Option<i32>,
    /// Standard output, lossily decoded.
    pub stdout: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
        }
    }

    /// Failed output with the given exit code.
    pub fn failure(code: i32) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
        }
    }

    /// Whether the command exited with status 0.
    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs host utilities and captures their output.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, stdin and stderr discarded.
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        tracing::trace!(program, ?args, "running host command");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

/// Replaces the current process with another program.
pub trait ProcessReplacer {
    /// Exec `program` with `args` (excluding argv\[0\]).
    ///
    /// Never returns on success; the returned error describes the failure.
    fn replace(&self, program: &Path, args: &[String]) -> io::Error;
}

/// [`ProcessReplacer`] using `execv`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecReplacer;

impl ProcessReplacer for ExecReplacer {
    fn replace(&self, program: &Path, args: &[String]) -> io::Error {
        use std::os::unix::process::CommandExt;

        tracing::debug!(program = %program.display(), ?args, "replacing process");
        Command::new(program).args(args).exec()
    }
}

/// Whether standard input is attached to a terminal.
pub fn stdin_is_tty() -> bool {
    unsafe { libc::isatty(libc::STDIN_FILENO) == 1 }
}

/// Convert string slices into owned arguments.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_runner_captures_stdout() {
        let output = SystemRunner.run("echo", &args(["hello"])).unwrap();
        assert!(output.is_success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn test_system_runner_reports_exit_code() {
        let output = SystemRunner.run("sh", &args(["-c", "exit 3"])).unwrap();
        assert_eq!(output.code, Some(3));
        assert!(!output.is_success());
    }

    #[test]
    fn test_system_runner_missing_program() {
        assert!(SystemRunner
            .run("/nonexistent/definitely-not-here", &[])
            .is_err());
    }

    #[test]
    fn test_exec_replacer_missing_program_returns_error() {
        let err = ExecReplacer.replace(Path::new("/nonexistent/ssh"), &[]);
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
