//! Running the external ELF patch tool.

use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread;
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::path::MAX_PATH;
use crate::{Error, Result};

/// Default bound on a single tool invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One invocation of an external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ToolCommand {
    /// Tool binary.
    pub program: PathBuf,
    /// Arguments, without the program name.
    pub args: Vec<String>,
}

impl ToolCommand {
    /// Creates an invocation of `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends a path argument.
    #[must_use]
    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy())
    }
}

/// Runs tool invocations and captures the first line of their output.
pub trait ToolRunner: Send + Sync {
    /// Runs `cmd` to completion.
    ///
    /// Returns the first line of standard output, trimmed. Fails with
    /// [`Error::ExternalToolFailed`] on spawn failure or non-zero exit, and
    /// [`Error::ToolTimedOut`] if the tool had to be killed.
    fn run(&self, cmd: &ToolCommand) -> Result<String>;
}

/// Runs tools as child processes with an empty environment.
#[derive(Debug, Clone, Copy)]
pub struct ProcessRunner {
    /// Wait bound per invocation.
    timeout: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl ProcessRunner {
    /// Creates a runner that kills tools running longer than `timeout`.
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ToolRunner for ProcessRunner {
    fn run(&self, cmd: &ToolCommand) -> Result<String> {
        let failed = |reason: String| Error::ExternalToolFailed {
            tool: cmd.program.clone(),
            reason,
        };

        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| failed(format!("spawn: {e}")))?;

        // Output is read while the tool runs so a full pipe cannot stall it.
        let reader = child.stdout.take().map(|stdout| thread::spawn(move || first_line(stdout)));

        let status = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                reap(&mut child);
                return Err(Error::ToolTimedOut {
                    tool: cmd.program.clone(),
                    timeout: self.timeout,
                });
            }
            Err(e) => {
                reap(&mut child);
                return Err(failed(format!("wait: {e}")));
            }
        };

        let read = match reader.map(thread::JoinHandle::join) {
            None => Ok(String::new()),
            Some(Ok(read)) => read,
            Some(Err(_)) => return Err(failed("output reader panicked".to_owned())),
        };
        if !status.success() {
            return Err(failed(format!("exited with {status}")));
        }
        let line = read.map_err(|e| failed(format!("reading output: {e}")))?;
        tracing::trace!(tool = %cmd.program.display(), args = ?cmd.args, output = line.trim(), "tool finished");
        Ok(line.trim().to_owned())
    }
}

/// Reads the first line, bounded by [`MAX_PATH`], then drains the rest.
fn first_line(stdout: ChildStdout) -> io::Result<String> {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    let read = (&mut reader).take(MAX_PATH as u64).read_line(&mut line);
    let _ = io::copy(&mut reader, &mut io::sink());
    read.map(|_| line)
}

/// Kills and waits for a tool that is being abandoned.
fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn captures_first_line() {
        let cmd = ToolCommand::new("/bin/sh").arg("-c").arg("echo '  /lib/ld.so  '; echo second");
        let out = ProcessRunner::default().run(&cmd).unwrap();
        assert_eq!(out, "/lib/ld.so");
    }

    #[test]
    fn runs_with_empty_environment() {
        let cmd = ToolCommand::new("/bin/sh").arg("-c").arg("echo \"[$HOME]\"");
        let out = ProcessRunner::default().run(&cmd).unwrap();
        assert_eq!(out, "[]");
    }

    #[test]
    fn nonzero_exit_fails() {
        let cmd = ToolCommand::new("/bin/sh").arg("-c").arg("exit 3");
        let err = ProcessRunner::default().run(&cmd).unwrap_err();
        assert!(matches!(err, Error::ExternalToolFailed { .. }));
    }

    #[test]
    fn missing_tool_fails() {
        let err = ProcessRunner::default()
            .run(&ToolCommand::new("/nonexistent/patchelf"))
            .unwrap_err();
        assert!(matches!(err, Error::ExternalToolFailed { .. }));
    }

    #[test]
    fn large_output_does_not_stall_the_tool() {
        let script = "echo /lib/ld.so; i=0; while [ $i -lt 4000 ]; do \
            echo xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx; i=$((i+1)); done";
        let cmd = ToolCommand::new("/bin/sh").arg("-c").arg(script);
        let out = ProcessRunner::new(Duration::from_secs(10)).run(&cmd).unwrap();
        assert_eq!(out, "/lib/ld.so");
    }

    #[test]
    fn hung_tool_is_killed() {
        let cmd = ToolCommand::new("/bin/sh").arg("-c").arg("sleep 10");
        let runner = ProcessRunner::new(Duration::from_millis(100));
        let err = runner.run(&cmd).unwrap_err();
        assert!(matches!(err, Error::ToolTimedOut { .. }));
    }
}
