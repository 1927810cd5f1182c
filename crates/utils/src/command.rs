//! Running host commands.
//!
//! Everything in osprov that touches the host (partitioning tools, package
//! managers, firmware variables) goes through a [`CommandExecutor`] so that
//! callers can substitute a fake in tests.

use std::io::{Read, Seek, Write};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, writing `buf` to its stdin if provided,
    /// and return its stdout. On failure the error includes the tail of stderr.
    fn run_with_stdin_buf(&mut self, buf: Option<&[u8]>) -> Result<String>;

    /// Execute the child process and return an error if it exited unsuccessfully.
    fn run_capture_stderr(&mut self) -> Result<()> {
        self.run_with_stdin_buf(None).map(drop)
    }

    /// Execute the child process and return its stdout as a string.
    fn run_get_string(&mut self) -> Result<String> {
        self.run_with_stdin_buf(None)
    }

    /// Render the commandline in a form that could be pasted into a shell.
    fn to_string_pretty(&self) -> String;
}

/// Helpers intended for [`std::process::ExitStatus`].
pub trait ExitStatusExt {
    /// If the exit status signals it was not successful, return an error.
    /// Note that we intentionally *don't* include the command string
    /// in the output; we leave it to the caller to add that if they want,
    /// as it may be verbose.
    fn check_status(&self, stderr: std::fs::File) -> Result<()>;
}

/// Parse the last chunk (e.g. 1024 bytes) from the provided file,
/// ensure it's UTF-8, and return that value. This function is infallible;
/// if the file cannot be read for some reason, a copy of a static string
/// is returned.
fn last_utf8_content_from_file(mut f: std::fs::File) -> String {
    // u16 since we truncate to just the trailing bytes here
    // to avoid pathological error messages
    const MAX_STDERR_BYTES: u16 = 1024;
    let size = f
        .metadata()
        .map_err(|e| tracing::warn!("failed to fstat: {e}"))
        .map(|m| m.len().try_into().unwrap_or(u16::MAX))
        .unwrap_or(0);
    let size = size.min(MAX_STDERR_BYTES);
    let seek_offset = -(size as i32);
    let mut stderr_buf = Vec::with_capacity(size.into());
    // We should never fail to seek()+read() really, but let's be conservative
    let r = match f
        .seek(std::io::SeekFrom::End(seek_offset.into()))
        .and_then(|_| f.read_to_end(&mut stderr_buf))
    {
        Ok(_) => String::from_utf8_lossy(&stderr_buf),
        Err(e) => {
            tracing::warn!("failed seek+read: {e}");
            "<failed to read stderr>".into()
        }
    };
    r.trim().to_owned()
}

impl ExitStatusExt for ExitStatus {
    fn check_status(&self, stderr: std::fs::File) -> Result<()> {
        let stderr_buf = last_utf8_content_from_file(stderr);
        if self.success() {
            return Ok(());
        }
        anyhow::bail!("Subprocess failed: {self:?}\n{stderr_buf}")
    }
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn run_with_stdin_buf(&mut self, buf: Option<&[u8]>) -> Result<String> {
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        self.stdout(Stdio::piped());
        self.stdin(if buf.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let mut child = self
            .spawn()
            .with_context(|| format!("Spawning {}", self.to_string_pretty()))?;
        if let Some(buf) = buf {
            let mut stdin = child.stdin.take().context("Missing child stdin")?;
            stdin.write_all(buf).context("Writing child stdin")?;
            // Dropping closes the pipe so the child sees EOF
            drop(stdin);
        }
        let output = child.wait_with_output()?;
        output
            .status
            .check_status(stderr)
            .with_context(|| format!("Running {}", self.to_string_pretty()))?;
        String::from_utf8(output.stdout).context("Decoding child stdout")
    }

    fn to_string_pretty(&self) -> String {
        std::iter::once(self.get_program())
            .chain(self.get_args())
            .map(|arg| {
                let arg = arg.to_string_lossy();
                shlex::try_quote(&arg)
                    .map(|q| q.into_owned())
                    .unwrap_or_else(|_| arg.into_owned())
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The seam through which all host commands are run.
pub trait CommandExecutor: std::fmt::Debug + Send + Sync {
    /// Run `cmd` to completion, feeding `stdin` to it if provided, and return
    /// its stdout. A nonzero exit is an error.
    fn execute(&self, cmd: &mut Command, stdin: Option<&[u8]>) -> Result<String>;

    /// Look up `program` in the host `PATH`. This must not have side effects.
    fn find_program(&self, program: &str) -> Option<PathBuf>;
}

/// Convenience wrappers over [`CommandExecutor::execute`].
pub trait ExecutorExt: CommandExecutor {
    /// Run a command, discarding its output.
    fn run(&self, cmd: &mut Command) -> Result<()> {
        self.execute(cmd, None).map(drop)
    }

    /// Run a command and return its stdout.
    fn run_get_string(&self, cmd: &mut Command) -> Result<String> {
        self.execute(cmd, None)
    }

    /// Run a command with the provided buffer as stdin.
    fn run_with_stdin(&self, cmd: &mut Command, stdin: &[u8]) -> Result<String> {
        self.execute(cmd, Some(stdin))
    }

    /// Run a command and deserialize its stdout as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&self, cmd: &mut Command) -> Result<T> {
        let stdout = self.execute(cmd, None)?;
        serde_json::from_str(&stdout)
            .with_context(|| format!("Parsing JSON from {}", cmd.to_string_pretty()))
    }
}

impl<E: CommandExecutor + ?Sized> ExecutorExt for E {}

/// Runs commands on the real host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostExecutor;

impl CommandExecutor for HostExecutor {
    fn execute(&self, cmd: &mut Command, stdin: Option<&[u8]>) -> Result<String> {
        cmd.log_debug().run_with_stdin_buf(stdin)
    }

    fn find_program(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_run_ext() {
        Command::new("true").run_capture_stderr().unwrap();
        assert_eq!(
            Command::new("echo").arg("hello").run_get_string().unwrap(),
            "hello\n"
        );
        let e = Command::new("/bin/sh")
            .args(["-c", "echo expected-this-oops-message 1>&2; exit 1"])
            .run_capture_stderr()
            .err()
            .unwrap();
        let msg = format!("{e:#}");
        assert!(msg.contains("expected-this-oops-message"), "{msg}");
        assert!(msg.contains("Running /bin/sh"), "{msg}");
    }

    #[test]
    fn command_stdin() {
        let out = Command::new("cat")
            .run_with_stdin_buf(Some(b"label: gpt\n"))
            .unwrap();
        assert_eq!(out, "label: gpt\n");
    }

    #[test]
    fn command_pretty() {
        let mut c = Command::new("efibootmgr");
        c.args(["-c", "-L", "my label", "-p", "1"]);
        similar_asserts::assert_eq!(c.to_string_pretty(), "efibootmgr -c -L 'my label' -p 1");
    }

    #[test]
    fn host_executor_json() {
        #[derive(serde::Deserialize)]
        struct V {
            a: u32,
        }
        let mut c = Command::new("echo");
        c.arg(r#"{"a": 42}"#);
        let v: V = HostExecutor.run_and_parse_json(&mut c).unwrap();
        assert_eq!(v.a, 42);
        assert!(HostExecutor.find_program("sh").is_some());
        assert!(HostExecutor
            .find_program("osprov-no-such-program-exists")
            .is_none());
    }
}
