//! Configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A status substring that pins overall progress to a fixed percentage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Substring searched for in `status` messages.
    pub contains: String,
    /// Overall progress reported when the substring is seen.
    pub percent: f32,
}

impl Checkpoint {
    #[must_use]
    pub fn new(contains: impl Into<String>, percent: f32) -> Self {
        Self {
            contains: contains.into(),
            percent,
        }
    }
}

/// Portion of the overall progress bar covered by sampling steps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressRange {
    pub start: f32,
    pub end: f32,
}

impl Default for ProgressRange {
    fn default() -> Self {
        Self {
            start: 10.0,
            end: 95.0,
        }
    }
}

/// Policy for turning the child's output into overall progress.
///
/// Model loading owns 0 to `step_range.start`, sampling owns the step range,
/// and decoding owns the rest up to `complete_percent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressPolicy {
    /// Text that marks the end of the percentage in a progress bar line.
    pub bar_marker: String,
    /// Throughput suffixes, at least one of which must appear in a bar line.
    pub rate_markers: Vec<String>,
    /// Range the bar's 0 to 100 is mapped into.
    pub step_range: ProgressRange,
    /// Status checkpoints, checked in order; the first match wins.
    pub checkpoints: Vec<Checkpoint>,
    /// Progress reported alongside a `complete` record.
    pub complete_percent: f32,
}

impl Default for ProgressPolicy {
    fn default() -> Self {
        Self {
            bar_marker: "%|".to_string(),
            rate_markers: vec!["it/s".to_string(), "s/it".to_string()],
            step_range: ProgressRange::default(),
            checkpoints: vec![
                Checkpoint::new("Loading models", 1.0),
                Checkpoint::new("Models loaded", 10.0),
                Checkpoint::new("Decoding latents", 95.0),
            ],
            complete_percent: 100.0,
        }
    }
}

impl ProgressPolicy {
    /// Map a raw bar percentage (0 to 100) into the overall range.
    #[must_use]
    pub fn map_step_percent(&self, raw: u8) -> f32 {
        let fraction = f32::from(raw.min(100)) / 100.0;
        self.step_range.start + fraction * (self.step_range.end - self.step_range.start)
    }

    /// Find the checkpoint percentage for a status message, if any.
    #[must_use]
    pub fn checkpoint_for(&self, message: &str) -> Option<f32> {
        self.checkpoints
            .iter()
            .find(|c| message.contains(c.contains.as_str()))
            .map(|c| c.percent)
    }

    /// Returns true if the line has the textual shape of a progress bar.
    #[must_use]
    pub fn looks_like_bar(&self, line: &str) -> bool {
        line.contains(self.bar_marker.as_str())
            && self.rate_markers.iter().any(|m| line.contains(m.as_str()))
    }
}

/// Configuration for the process supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Flag telling the child it is driven by a supervisor, not a human.
    pub marker_flag: String,
    /// Flag preceding the encoded parameter blob.
    pub params_flag: String,
    /// Launcher file name resolved next to the path given to launch.
    /// When unset, the given path is executed directly.
    pub launcher: Option<String>,
    /// Sleep between reader passes, in milliseconds.
    pub poll_interval_ms: u64,
    /// Also pipe and classify the child's stderr.
    pub capture_stderr: bool,
    /// Grace period for a child that reported completion to exit on its own.
    pub finish_grace_ms: u64,
    /// Progress mapping policy.
    pub progress: ProgressPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            marker_flag: "--ue".to_string(),
            params_flag: "--params-base64".to_string(),
            launcher: None,
            poll_interval_ms: 20,
            capture_stderr: true,
            finish_grace_ms: 5000,
            progress: ProgressPolicy::default(),
        }
    }
}

impl SupervisorConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    #[must_use]
    pub fn finish_grace(&self) -> Duration {
        Duration::from_millis(self.finish_grace_ms)
    }
}
