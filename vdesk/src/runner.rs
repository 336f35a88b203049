//! Shelling out to backend command-line tools.
//!
//! The local hypervisor, container, and cluster backends are driven through
//! their CLIs (`qemu-system-x86_64`, `docker`, `kubectl`). Execution goes
//! through one small trait so tests can substitute canned transcripts for
//! real binaries.

use std::ffi::OsString;
use std::io::Write;
use std::process::{Command, Stdio};

use crate::error::{Error, Result};

/// Captured result of one finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Run `program` to completion, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput>;

    /// Run `program` to completion with `stdin` piped to it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Spawn`] if the command cannot be started or fed.
    fn run_with_stdin(
        &self,
        program: &str,
        args: &[OsString],
        stdin: &str,
    ) -> Result<CommandOutput>;

    /// Start a long-lived process with no inherited stdio and return its pid.
    ///
    /// The child is not waited on; callers track it by pid.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Spawn`] if the command cannot be started.
    fn spawn_detached(&self, program: &str, args: &[OsString]) -> Result<u32>;
}

/// Real runner that shells out to the host operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| spawn_error(program, e))?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn run_with_stdin(
        &self,
        program: &str,
        args: &[OsString],
        stdin: &str,
    ) -> Result<CommandOutput> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(program, e))?;
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin.as_bytes()).map_err(|e| Error::Spawn {
                program: program.to_string(),
                reason: format!("writing stdin: {e}"),
            })?;
            // Pipe drops here so the child sees EOF.
        }
        let output = child
            .wait_with_output()
            .map_err(|e| spawn_error(program, e))?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn_detached(&self, program: &str, args: &[OsString]) -> Result<u32> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| spawn_error(program, e))?;
        Ok(child.id())
    }
}

fn spawn_error(program: &str, e: std::io::Error) -> Error {
    Error::Spawn {
        program: program.to_string(),
        reason: e.to_string(),
    }
}

/// Map a non-zero exit into [`Error::CommandFailed`].
///
/// # Errors
///
/// Returns [`Error::CommandFailed`] carrying the program name, exit status,
/// and trimmed stderr.
pub fn require_success(program: &str, output: CommandOutput) -> Result<CommandOutput> {
    if output.is_success() {
        return Ok(output);
    }
    let status = output
        .code
        .map_or_else(|| "signal".to_string(), |c| c.to_string());
    Err(Error::CommandFailed {
        program: program.to_string(),
        status,
        stderr: output.stderr.trim().to_string(),
    })
}

/// Convenience for building argument vectors from literals.
#[must_use]
pub fn os_args(args: &[&str]) -> Vec<OsString> {
    args.iter().map(OsString::from).collect()
}
