//! `convert` process spawning and control.
//!
//! A [`ConvertProcess`] owns exactly one child with all three standard
//! streams piped. The pipes are handed out once through
//! [`ConvertProcess::take_pipes`]; the process itself stays with the handle
//! so it can be waited on or terminated.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::args::ConvertArgs;

/// Error type for process spawning operations.
#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    /// The binary was not found.
    #[error("binary not found")]
    NotFound,
    /// Permission denied when spawning.
    #[error("permission denied")]
    PermissionDenied,
    /// Other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpawnError {
    /// Create a `SpawnError` from an I/O error, classifying common cases.
    fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Io(err),
        }
    }
}

/// The three pipes of a spawned process.
#[derive(Debug)]
pub struct ProcessPipes {
    /// Bytes written here feed the process.
    pub stdin: ChildStdin,
    /// Transformed bytes produced by the process.
    pub stdout: ChildStdout,
    /// Diagnostic text emitted by the process.
    pub stderr: ChildStderr,
}

/// A running `convert` process.
#[derive(Debug)]
pub struct ConvertProcess {
    child: Child,
    binary: String,
}

impl ConvertProcess {
    /// Spawn `binary` (`convert`, `magick` or a test double) with the given
    /// arguments.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the process fails to spawn.
    pub fn spawn_with_binary(
        binary: &str,
        args: &ConvertArgs,
        working_dir: Option<&Path>,
    ) -> Result<Self, SpawnError> {
        let mut cmd = Command::new(binary);
        cmd.args(args.build_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(SpawnError::from_io)?;
        tracing::debug!(
            pid = ?child.id(),
            command = %args.command_line(binary),
            "Spawned process"
        );

        Ok(Self {
            child,
            binary: binary.to_string(),
        })
    }

    /// Take ownership of all three pipes.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn take_pipes(&mut self) -> Option<ProcessPipes> {
        let stdin = self.child.stdin.take();
        let stdout = self.child.stdout.take();
        let stderr = self.child.stderr.take();
        match (stdin, stdout, stderr) {
            (Some(stdin), Some(stdout), Some(stderr)) => Some(ProcessPipes {
                stdin,
                stdout,
                stderr,
            }),
            _ => None,
        }
    }

    /// The binary this process was started from.
    #[must_use]
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Get the process ID, if still running.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Check if the process has exited without blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the process state cannot be queried.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Wait for the process to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting fails.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Forcefully kill the process.
    ///
    /// # Errors
    ///
    /// Returns an error if the kill signal cannot be sent.
    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }

    /// Attempt graceful termination with a timeout.
    ///
    /// On Unix, sends SIGTERM first, then SIGKILL after the timeout.
    /// On other platforms, falls back to immediate kill.
    ///
    /// # Errors
    ///
    /// Returns an error if termination fails.
    pub async fn graceful_terminate(&mut self, timeout: Duration) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            self.graceful_terminate_unix(timeout).await
        }

        #[cfg(not(unix))]
        {
            let _ = timeout;
            self.kill().await
        }
    }

    #[cfg(unix)]
    async fn graceful_terminate_unix(&mut self, timeout: Duration) -> std::io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.id() else {
            // Already reaped
            return Ok(());
        };

        let nix_pid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
        let _ = kill(nix_pid, Signal::SIGTERM);

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::debug!(pid, "Process ignored SIGTERM, killing");
                self.child.kill().await
            }
        }
    }
}
