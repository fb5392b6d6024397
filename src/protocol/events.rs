//! Event types for the generator's output line protocol.
//!
//! The child writes one JSON record per line on stdout, tagged by `type`.
//! Anything else on the stream is free text, some of which is a tqdm-style
//! progress bar.

use serde::Deserialize;

/// A single progress observation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Overall progress in percent, 0 to 100.
    pub percentage: f32,
    /// Current sampling step, when the source line carries one.
    pub step: Option<u32>,
    /// Total sampling steps, when the source line carries one.
    pub total_steps: Option<u32>,
    /// The line this update was derived from.
    pub raw_line: String,
}

impl ProgressUpdate {
    /// Create an update pinned to a fixed percentage with no step information.
    #[must_use]
    pub fn checkpoint(percentage: f32, raw_line: impl Into<String>) -> Self {
        Self {
            percentage,
            step: None,
            total_steps: None,
            raw_line: raw_line.into(),
        }
    }
}

/// One classified output line.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedEvent {
    /// Human-readable phase description.
    Status {
        /// The status message.
        message: String,
    },
    /// Progress update, coarse checkpoint or fine-grained sampling step.
    Progress(ProgressUpdate),
    /// Terminal success with the produced asset paths.
    Complete {
        /// Path of the primary asset (PLY).
        primary_output: Option<String>,
        /// Path of the secondary asset (OBJ).
        secondary_output: Option<String>,
        /// The line this event was parsed from.
        raw_line: String,
    },
    /// Terminal failure reported by the child or by the supervisor.
    Error {
        /// Error message.
        message: String,
        /// Error kind label, passed through verbatim from the child.
        error_kind: String,
        /// The line this event was parsed from; empty for supervisor errors.
        raw_line: String,
    },
    /// Informational log line.
    Info {
        /// The message.
        message: String,
    },
    /// Debug log line.
    Debug {
        /// The message.
        message: String,
    },
    /// A line that matched neither protocol.
    Unrecognized {
        /// The line as received.
        raw_line: String,
    },
}

impl ClassifiedEvent {
    /// Returns true if this event ends the session (`complete` or `error` record).
    #[must_use]
    pub fn ends_session(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// Returns the progress percentage if this is a progress event.
    #[must_use]
    pub fn percentage(&self) -> Option<f32> {
        match self {
            Self::Progress(update) => Some(update.percentage),
            _ => None,
        }
    }

    /// Short lowercase name of the variant, used in logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Progress(_) => "progress",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::Info { .. } => "info",
            Self::Debug { .. } => "debug",
            Self::Unrecognized { .. } => "unrecognized",
        }
    }
}

/// Error kind used for `error` records that omit `error_type`.
pub const UNKNOWN_ERROR_KIND: &str = "Unknown";

/// Error kind used for `internal_error` records.
pub const INTERNAL_ERROR_KIND: &str = "InternalError";

/// Structured record as written by the child, one per line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputRecord {
    /// Phase description.
    Status {
        #[serde(default)]
        message: String,
    },
    /// Generation finished; either path may be null if saving failed.
    Complete {
        #[serde(default)]
        ply_file: Option<String>,
        #[serde(default)]
        obj_file: Option<String>,
    },
    /// Generation failed.
    Error {
        #[serde(default)]
        message: String,
        #[serde(default)]
        error_type: Option<String>,
        #[serde(default)]
        traceback: Option<String>,
    },
    /// The child failed to serialize one of its own messages.
    InternalError {
        #[serde(default)]
        message: String,
    },
    /// Informational message.
    Info {
        #[serde(default)]
        message: String,
    },
    /// Debug message.
    Debug {
        #[serde(default)]
        message: String,
    },
    /// Catch-all for record types this supervisor does not know.
    #[serde(other)]
    Unknown,
}
