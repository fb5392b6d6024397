//! Colored CLI display utilities for supervisor output.
//!
//! This module provides functions for printing colored, formatted output
//! to the terminal while a generation session is supervised.

use std::io::{self, Write};
use std::path::Path;

use chrono::Utc;
use owo_colors::OwoColorize;

use crate::protocol::{ClassifiedEvent, ProgressUpdate};
use crate::supervisor::{SessionId, SupervisorEvent};

/// Get current timestamp in the same format as tracing.
fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Width of the textual progress bar.
const BAR_WIDTH: usize = 30;

/// Truncate a string to a maximum number of characters, adding ellipsis if truncated.
#[must_use]
pub fn truncate(s: &str, max_len: usize, raw_mode: bool) -> String {
    if raw_mode || s.chars().count() <= max_len {
        return s.to_string();
    }
    if max_len <= 3 {
        return "...".to_string();
    }
    let head: String = s.chars().take(max_len - 3).collect();
    format!("{head}...")
}

/// Render a percentage as a fixed-width bar.
#[must_use]
pub fn progress_bar(percentage: f32) -> String {
    let clamped = percentage.clamp(0.0, 100.0);
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let filled = ((clamped / 100.0) * BAR_WIDTH as f32).round() as usize;
    format!(
        "[{}{}]",
        "#".repeat(filled.min(BAR_WIDTH)),
        "-".repeat(BAR_WIDTH - filled.min(BAR_WIDTH))
    )
}

/// Print launch information.
pub fn print_launch(session: SessionId, executable: &Path, pid: Option<u32>) {
    println!(
        "{} {} {} session={} pid={}",
        timestamp().dimmed(),
        "[LAUNCH]".blue().bold(),
        executable.display().cyan(),
        session.dimmed(),
        pid.map_or_else(|| "?".to_string(), |p| p.to_string())
            .dimmed()
    );
    let _ = io::stdout().flush();
}

/// Print a progress update.
pub fn print_progress(update: &ProgressUpdate) {
    let steps = match (update.step, update.total_steps) {
        (Some(step), Some(total)) => format!(" step {step}/{total}"),
        _ => String::new(),
    };
    println!(
        "{} {} {} {:5.1}%{}",
        timestamp().dimmed(),
        "[PROGRESS]".cyan().bold(),
        progress_bar(update.percentage),
        update.percentage,
        steps.dimmed()
    );
    let _ = io::stdout().flush();
}

/// Print a status message.
pub fn print_status(message: &str) {
    println!(
        "{} {} {}",
        timestamp().dimmed(),
        "[STATUS]".blue().bold(),
        message
    );
    let _ = io::stdout().flush();
}

/// Print the produced assets.
pub fn print_complete(primary: Option<&str>, secondary: Option<&str>) {
    println!(
        "{} {} ply={} obj={}",
        timestamp().dimmed(),
        "[COMPLETE]".green().bold(),
        primary.unwrap_or("-").cyan(),
        secondary.unwrap_or("-").cyan()
    );
    let _ = io::stdout().flush();
}

/// Print an error message with its kind.
pub fn print_error(message: &str, kind: &str) {
    println!(
        "{} {} {} {}",
        timestamp().dimmed(),
        "[ERROR]".red().bold(),
        format!("({kind})").dimmed(),
        message.red()
    );
    let _ = io::stdout().flush();
}

/// Print an informational message.
pub fn print_info(message: &str, raw_mode: bool) {
    println!(
        "{} {} {}",
        timestamp().dimmed(),
        "[INFO]".dimmed(),
        truncate(message, 200, raw_mode)
    );
    let _ = io::stdout().flush();
}

/// Print the end of a session.
pub fn print_finished() {
    println!(
        "{} {} Generator process finished",
        timestamp().dimmed(),
        "[SESSION]".blue().bold()
    );
    let _ = io::stdout().flush();
}

/// Print any supervisor event.
pub fn print_event(event: &SupervisorEvent, raw_mode: bool) {
    match event {
        SupervisorEvent::Progress(update) => print_progress(update),
        SupervisorEvent::Status { message } => print_status(message),
        SupervisorEvent::Complete {
            primary_output,
            secondary_output,
            ..
        } => print_complete(primary_output.as_deref(), secondary_output.as_deref()),
        SupervisorEvent::Error {
            message,
            error_kind,
            ..
        } => print_error(message, error_kind),
        SupervisorEvent::Info { message } => print_info(message, raw_mode),
        SupervisorEvent::ProcessFinished => print_finished(),
    }
}

/// Print the classification of one line.
pub fn print_classified(event: &ClassifiedEvent, raw_mode: bool) {
    let label = format!("[{}]", event.label().to_uppercase());
    let detail = match event {
        ClassifiedEvent::Status { message }
        | ClassifiedEvent::Info { message }
        | ClassifiedEvent::Debug { message } => message.clone(),
        ClassifiedEvent::Progress(update) => match (update.step, update.total_steps) {
            (Some(step), Some(total)) => format!("{:.1}% ({step}/{total})", update.percentage),
            _ => format!("{:.1}%", update.percentage),
        },
        ClassifiedEvent::Complete {
            primary_output,
            secondary_output,
            ..
        } => format!(
            "ply={} obj={}",
            primary_output.as_deref().unwrap_or("-"),
            secondary_output.as_deref().unwrap_or("-")
        ),
        ClassifiedEvent::Error {
            message,
            error_kind,
            ..
        } => format!("({error_kind}) {message}"),
        ClassifiedEvent::Unrecognized { raw_line } => raw_line.clone(),
    };
    println!(
        "{} {}",
        label.yellow().bold(),
        truncate(&detail, 150, raw_mode)
    );
    let _ = io::stdout().flush();
}
