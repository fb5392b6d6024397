//! Supervisor error types.

use std::path::PathBuf;

use crate::protocol::ParamsError;

/// Error type for supervisor operations.
///
/// Every variant is recoverable: the manager cleans up before returning and
/// stays usable. Each error is also delivered to subscribers as an Error event
/// whose kind is [`SupervisorError::kind`].
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    /// A generation process is already active.
    #[error("Another generation process is already running")]
    ProcessBusy,
    /// The executable to launch does not exist.
    #[error("Executable not found: {0}")]
    FileNotFound(PathBuf),
    /// The output channel of the child could not be set up.
    #[error("Failed to capture output of generation process")]
    PipeError,
    /// Spawning the child failed.
    #[error("Failed to launch generation process: {0}")]
    ProcessLaunchError(#[source] std::io::Error),
    /// The output reader thread could not be started.
    #[error("Failed to start output reader thread: {0}")]
    ThreadError(#[source] std::io::Error),
    /// The parameters could not be encoded.
    #[error("Failed to encode parameters: {0}")]
    InvalidParameters(#[from] ParamsError),
    /// No tokio runtime is available to drive the child.
    #[error("No tokio runtime available")]
    NoRuntime,
}

impl SupervisorError {
    /// Stable label carried as the error kind of the Error event.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProcessBusy => "ProcessBusy",
            Self::FileNotFound(_) => "FileNotFound",
            Self::PipeError => "PipeError",
            Self::ProcessLaunchError(_) => "ProcessLaunchError",
            Self::ThreadError(_) => "ThreadError",
            Self::InvalidParameters(_) => "InvalidParameters",
            Self::NoRuntime => "NoRuntime",
        }
    }
}
