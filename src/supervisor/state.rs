//! Session state machine.

use serde::{Deserialize, Serialize};

/// Current state of the supervised session slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No session; a launch may begin.
    #[default]
    Idle,
    /// A launch is in progress.
    Launching,
    /// A child process is running and its reader is active.
    Running,
    /// An explicit stop is tearing the session down.
    Stopping,
}

impl SessionState {
    /// Returns true if a new launch may begin.
    #[must_use]
    pub fn is_idle(self) -> bool {
        self == Self::Idle
    }

    /// Returns true if a session is active.
    #[must_use]
    pub fn is_running(self) -> bool {
        self == Self::Running
    }
}

/// State machine for the single session slot.
///
/// Leaving `Running` is the only transition that may announce a finished
/// session, so whichever path performs it owns the `ProcessFinished` event.
#[derive(Debug, Clone, Default)]
pub struct SessionStateMachine {
    state: SessionState,
    launches: usize,
    failed_launches: usize,
    finished: usize,
}

impl SessionStateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transition(&mut self, new_state: SessionState) {
        tracing::debug!(from = ?self.state, to = ?new_state, "State transition");
        self.state = new_state;
    }

    /// `Idle -> Launching`. Returns false, leaving the state untouched, if not idle.
    pub fn begin_launch(&mut self) -> bool {
        if !self.state.is_idle() {
            return false;
        }
        self.transition(SessionState::Launching);
        true
    }

    /// `Launching -> Running`.
    pub fn launched(&mut self) {
        self.launches = self.launches.saturating_add(1);
        self.transition(SessionState::Running);
    }

    /// `Launching -> Idle` after a failed launch.
    pub fn launch_failed(&mut self) {
        self.failed_launches = self.failed_launches.saturating_add(1);
        self.transition(SessionState::Idle);
    }

    /// `Running -> next`. Returns false if the session was not running.
    pub fn leave_running(&mut self, next: SessionState) -> bool {
        if !self.state.is_running() {
            return false;
        }
        self.finished = self.finished.saturating_add(1);
        self.transition(next);
        true
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            launches: self.launches,
            failed_launches: self.failed_launches,
            finished: self.finished,
        }
    }
}

/// Session statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub launches: usize,
    pub failed_launches: usize,
    pub finished: usize,
}
