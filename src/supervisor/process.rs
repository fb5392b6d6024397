//! Generator process spawning and control.
//!
//! This module provides a builder for the generator command line and a
//! handle over the spawned child. The child runs hidden, detached from the
//! controlling terminal (its own process group on unix), with stdin closed
//! and stdout piped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::runtime::Handle;

use crate::config::SupervisorConfig;
use crate::protocol::{GenerationParameters, ParamsError};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Builder for the generator command line.
#[derive(Debug, Clone)]
pub struct GenerationCommand {
    executable: PathBuf,
    params_blob: String,
    marker_flag: String,
    params_flag: String,
    working_dir: Option<PathBuf>,
    capture_stderr: bool,
}

impl GenerationCommand {
    /// Create a command for the given executable and parameters.
    ///
    /// # Errors
    ///
    /// Returns `ParamsError` if the parameters cannot be encoded.
    pub fn new(
        executable: impl Into<PathBuf>,
        params: &GenerationParameters,
    ) -> Result<Self, ParamsError> {
        let executable = executable.into();
        let defaults = SupervisorConfig::default();
        Ok(Self {
            working_dir: executable.parent().map(Path::to_path_buf),
            executable,
            params_blob: params.encode()?,
            marker_flag: defaults.marker_flag,
            params_flag: defaults.params_flag,
            capture_stderr: defaults.capture_stderr,
        })
    }

    /// Create a command using the flags and stream settings from `config`.
    ///
    /// # Errors
    ///
    /// Returns `ParamsError` if the parameters cannot be encoded.
    pub fn from_config(
        executable: impl Into<PathBuf>,
        params: &GenerationParameters,
        config: &SupervisorConfig,
    ) -> Result<Self, ParamsError> {
        Ok(Self::new(executable, params)?
            .marker_flag(config.marker_flag.clone())
            .params_flag(config.params_flag.clone())
            .capture_stderr(config.capture_stderr))
    }

    /// Set the flag marking a supervised, non-interactive run.
    #[must_use]
    pub fn marker_flag(mut self, flag: impl Into<String>) -> Self {
        self.marker_flag = flag.into();
        self
    }

    /// Set the flag that precedes the parameter blob.
    #[must_use]
    pub fn params_flag(mut self, flag: impl Into<String>) -> Self {
        self.params_flag = flag.into();
        self
    }

    /// Set the working directory. Defaults to the executable's directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Pipe stderr as well as stdout.
    #[must_use]
    pub fn capture_stderr(mut self, capture: bool) -> Self {
        self.capture_stderr = capture;
        self
    }

    /// Get the executable path.
    #[must_use]
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Get the working directory, if set.
    #[must_use]
    pub fn get_working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// Build the command-line arguments.
    #[must_use]
    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(3);
        if !self.marker_flag.is_empty() {
            args.push(self.marker_flag.clone());
        }
        args.push(self.params_flag.clone());
        args.push(self.params_blob.clone());
        args
    }

    /// Spawn the generator.
    ///
    /// Must be called within a tokio runtime context.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the process fails to spawn.
    pub fn spawn(&self) -> std::io::Result<GenerationProcess> {
        let mut cmd = Command::new(&self.executable);
        cmd.args(self.build_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(if self.capture_stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        if let Some(ref dir) = self.working_dir {
            if !dir.as_os_str().is_empty() {
                cmd.current_dir(dir);
            }
        }

        #[cfg(unix)]
        cmd.process_group(0);

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let child = cmd.spawn()?;
        Ok(GenerationProcess::new(child))
    }
}

/// A running generator process.
#[derive(Debug)]
pub struct GenerationProcess {
    child: Child,
    pid: Option<u32>,
}

impl GenerationProcess {
    fn new(child: Child) -> Self {
        let pid = child.id();
        Self { child, pid }
    }

    /// Take ownership of the stdout handle.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take ownership of the stderr handle.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Process ID recorded at spawn.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Check whether the process is still alive without blocking.
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::debug!(pid = ?self.pid, %status, "Generator process has exited");
                false
            }
            Err(e) => {
                tracing::warn!(pid = ?self.pid, error = %e, "Failed to query generator process");
                false
            }
        }
    }

    /// Forcefully terminate the process (and its process group on unix),
    /// then reap it in the background.
    pub fn kill(mut self, runtime: &Handle) {
        let _ = self.kill_now();
        runtime.spawn(async move {
            match self.child.wait().await {
                Ok(status) => tracing::debug!(pid = ?self.pid, %status, "Generator process reaped"),
                Err(e) => tracing::warn!(pid = ?self.pid, error = %e, "Failed to reap generator process"),
            }
        });
    }

    /// Let a process that reported its own end exit within `grace`, then kill it.
    pub fn release(mut self, grace: Duration, runtime: &Handle) {
        runtime.spawn(async move {
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(pid = ?self.pid, %status, "Generator process exited");
                }
                Ok(Err(e)) => {
                    tracing::warn!(pid = ?self.pid, error = %e, "Failed to wait for generator process");
                }
                Err(_) => {
                    tracing::warn!(pid = ?self.pid, "Generator process outlived its grace period, killing");
                    let _ = self.kill_now();
                    let _ = self.child.wait().await;
                }
            }
        });
    }

    /// Send the kill. Returns false without signalling anything if the child
    /// has already been reaped, since its pid may belong to someone else now.
    fn kill_now(&mut self) -> bool {
        if let Ok(Some(status)) = self.child.try_wait() {
            tracing::debug!(pid = ?self.pid, %status, "Generator process already exited");
            return false;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = self.pid {
                let group = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
                match killpg(group, Signal::SIGKILL) {
                    Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                    Err(e) => tracing::warn!(pid, error = %e, "Failed to signal process group"),
                }
            }
        }

        if let Err(e) = self.child.start_kill() {
            // Already exited and reaped.
            tracing::debug!(pid = ?self.pid, error = %e, "start_kill failed");
        }
        true
    }
}
