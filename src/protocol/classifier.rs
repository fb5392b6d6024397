//! Line classifier for generator output.
//!
//! Each non-blank line is either a structured JSON record or free text. Free
//! text is checked against the progress-bar heuristic of the configured
//! [`ProgressPolicy`]; everything else is `Unrecognized`.

use regex::Regex;

use crate::config::ProgressPolicy;
use crate::protocol::{
    ClassifiedEvent, OutputRecord, ProgressUpdate, INTERNAL_ERROR_KIND, UNKNOWN_ERROR_KIND,
};

/// Matches the `N/M` counter that follows the closing bar delimiter.
const STEP_COUNTER_PATTERN: &str = r"^[^|]*\|\s*(\d+)/(\d+)";

/// Classifies output lines into [`ClassifiedEvent`]s.
#[derive(Debug, Clone)]
pub struct LineClassifier {
    policy: ProgressPolicy,
    step_counter: Option<Regex>,
}

impl Default for LineClassifier {
    fn default() -> Self {
        Self::new(ProgressPolicy::default())
    }
}

impl LineClassifier {
    /// Create a classifier using the given progress policy.
    #[must_use]
    pub fn new(policy: ProgressPolicy) -> Self {
        let step_counter = match Regex::new(STEP_COUNTER_PATTERN) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to compile step counter pattern");
                None
            }
        };
        Self {
            policy,
            step_counter,
        }
    }

    /// Get the progress policy.
    #[must_use]
    pub fn policy(&self) -> &ProgressPolicy {
        &self.policy
    }

    /// Classify one line of output.
    ///
    /// Returns the events in delivery order. A `status` record matching a
    /// checkpoint yields the status followed by a pinned progress update; a
    /// `complete` record yields a final progress update followed by the
    /// completion. Every other line yields exactly one event.
    #[must_use]
    pub fn classify(&self, line: &str) -> Vec<ClassifiedEvent> {
        let trimmed = line.trim();
        match serde_json::from_str::<OutputRecord>(trimmed) {
            Ok(record) => self.classify_record(record, trimmed),
            Err(_) => vec![self.classify_text(line)],
        }
    }

    fn classify_record(&self, record: OutputRecord, raw_line: &str) -> Vec<ClassifiedEvent> {
        match record {
            OutputRecord::Status { message } => {
                let checkpoint = self.policy.checkpoint_for(&message);
                let mut events = vec![ClassifiedEvent::Status { message }];
                if let Some(percentage) = checkpoint {
                    events.push(ClassifiedEvent::Progress(ProgressUpdate::checkpoint(
                        percentage, raw_line,
                    )));
                }
                events
            }
            OutputRecord::Complete { ply_file, obj_file } => vec![
                ClassifiedEvent::Progress(ProgressUpdate::checkpoint(
                    self.policy.complete_percent,
                    raw_line,
                )),
                ClassifiedEvent::Complete {
                    primary_output: ply_file,
                    secondary_output: obj_file,
                    raw_line: raw_line.to_string(),
                },
            ],
            OutputRecord::Error {
                message,
                error_type,
                traceback,
            } => {
                if let Some(traceback) = traceback {
                    tracing::debug!(%traceback, "Generator reported traceback");
                }
                vec![ClassifiedEvent::Error {
                    message,
                    error_kind: error_type.unwrap_or_else(|| UNKNOWN_ERROR_KIND.to_string()),
                    raw_line: raw_line.to_string(),
                }]
            }
            OutputRecord::InternalError { message } => vec![ClassifiedEvent::Error {
                message,
                error_kind: INTERNAL_ERROR_KIND.to_string(),
                raw_line: raw_line.to_string(),
            }],
            OutputRecord::Info { message } => vec![ClassifiedEvent::Info { message }],
            OutputRecord::Debug { message } => vec![ClassifiedEvent::Debug { message }],
            OutputRecord::Unknown => {
                tracing::debug!(line = %raw_line, "Ignoring record of unknown type");
                vec![ClassifiedEvent::Unrecognized {
                    raw_line: raw_line.to_string(),
                }]
            }
        }
    }

    fn classify_text(&self, line: &str) -> ClassifiedEvent {
        let cleaned = line.replace('\r', "");
        let cleaned = cleaned.trim();

        if self.policy.looks_like_bar(cleaned) {
            if let Some(raw) = bar_percent(cleaned, &self.policy.bar_marker) {
                let (step, total_steps) = self.step_counter(cleaned).unzip();
                let percentage = self.policy.map_step_percent(raw);
                tracing::debug!(raw, percentage, "Parsed progress bar");
                return ClassifiedEvent::Progress(ProgressUpdate {
                    percentage,
                    step,
                    total_steps,
                    raw_line: cleaned.to_string(),
                });
            }
            tracing::warn!(line = %cleaned, "Progress bar without a readable percentage");
        } else {
            tracing::debug!(line = %cleaned, "Unrecognized output line");
        }

        ClassifiedEvent::Unrecognized {
            raw_line: line.to_string(),
        }
    }

    fn step_counter(&self, line: &str) -> Option<(u32, u32)> {
        let marker_end = line.find(self.policy.bar_marker.as_str())? + self.policy.bar_marker.len();
        let caps = self.step_counter.as_ref()?.captures(&line[marker_end..])?;
        let step = caps.get(1)?.as_str().parse().ok()?;
        let total = caps.get(2)?.as_str().parse().ok()?;
        Some((step, total))
    }
}

/// Extract the run of digits immediately preceding the bar marker, 0 to 100.
fn bar_percent(line: &str, marker: &str) -> Option<u8> {
    let head = &line[..line.find(marker)?];
    let digits = &head[head.trim_end_matches(|c: char| c.is_ascii_digit()).len()..];
    digits.parse::<u8>().ok().filter(|p| *p <= 100)
}
