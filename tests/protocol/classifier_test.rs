//! Tests for output line classification.

use shape_supervisor::config::{Checkpoint, ProgressPolicy, ProgressRange};
use shape_supervisor::protocol::{ClassifiedEvent, LineClassifier, ProgressUpdate};

fn classify(line: &str) -> Vec<ClassifiedEvent> {
    LineClassifier::default().classify(line)
}

fn assert_close(actual: f32, expected: f32) {
    assert!(
        (actual - expected).abs() < 1e-3,
        "expected {expected}, got {actual}"
    );
}

#[test]
fn status_record_with_checkpoint() {
    let events = classify(r#"{"type":"status","message":"Loading models..."}"#);
    assert_eq!(events.len(), 2);
    assert_eq!(
        events[0],
        ClassifiedEvent::Status {
            message: "Loading models...".to_string()
        }
    );
    assert_close(events[1].percentage().unwrap(), 1.0);
}

#[test]
fn status_record_without_checkpoint() {
    let events = classify(r#"{"type":"status","message":"Generating latents..."}"#);
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], ClassifiedEvent::Status { .. }));
}

#[test]
fn complete_record_ends_session_at_full_progress() {
    let line = r#"{"type":"complete","ply_file":"a.ply","obj_file":"a.obj"}"#;
    let events = classify(line);
    assert_eq!(events.len(), 2);
    assert_close(events[0].percentage().unwrap(), 100.0);
    assert_eq!(
        events[1],
        ClassifiedEvent::Complete {
            primary_output: Some("a.ply".to_string()),
            secondary_output: Some("a.obj".to_string()),
            raw_line: line.to_string(),
        }
    );
    assert!(events[1].ends_session());
}

#[test]
fn error_record_passes_kind_through() {
    let events = classify(r#"{"type":"error","message":"OOM","error_type":"MemoryError"}"#);
    match events.as_slice() {
        [event @ ClassifiedEvent::Error {
            message,
            error_kind,
            ..
        }] => {
            assert_eq!(message, "OOM");
            assert_eq!(error_kind, "MemoryError");
            assert!(event.ends_session());
        }
        other => panic!("Expected single Error, got {other:?}"),
    }
}

#[test]
fn error_record_without_kind() {
    let events = classify(r#"{"type":"error","message":"boom","traceback":"Traceback..."}"#);
    assert!(matches!(
        events.as_slice(),
        [ClassifiedEvent::Error { error_kind, .. }] if error_kind == "Unknown"
    ));
}

#[test]
fn internal_error_record() {
    let events = classify(r#"{"type":"internal_error","message":"bad json"}"#);
    assert!(matches!(
        events.as_slice(),
        [ClassifiedEvent::Error { error_kind, .. }] if error_kind == "InternalError"
    ));
}

#[test]
fn tqdm_line_maps_into_sampling_range() {
    let line = "  42%|████      | 42/100 [00:10<00:14, 4.20it/s]";
    let events = classify(line);
    match events.as_slice() {
        [ClassifiedEvent::Progress(ProgressUpdate {
            percentage,
            step,
            total_steps,
            raw_line,
        })] => {
            assert_close(*percentage, 45.7);
            assert_eq!(*step, Some(42));
            assert_eq!(*total_steps, Some(100));
            assert_eq!(raw_line, line.trim());
        }
        other => panic!("Expected single Progress, got {other:?}"),
    }
}

#[test]
fn carriage_returns_are_ignored_in_bar_lines() {
    let events = classify("\r100%|██████████| 64/64 [00:30<00:00, 2.10it/s]\r");
    assert_close(events[0].percentage().unwrap(), 95.0);
}

#[test]
fn garbage_is_unrecognized() {
    assert_eq!(
        classify("garbage output with no markers"),
        vec![ClassifiedEvent::Unrecognized {
            raw_line: "garbage output with no markers".to_string()
        }]
    );
}

#[test]
fn bar_shape_without_rate_is_unrecognized() {
    let events = classify(" 42%|████      | 42/100");
    assert!(matches!(events[0], ClassifiedEvent::Unrecognized { .. }));
}

#[test]
fn malformed_json_is_unrecognized() {
    let events = classify(r#"{"type":"status","message":"#);
    assert!(matches!(events[0], ClassifiedEvent::Unrecognized { .. }));
}

#[test]
fn unknown_record_type_is_unrecognized() {
    let events = classify(r#"{"type":"telemetry","gpu":"A100"}"#);
    assert!(matches!(events[0], ClassifiedEvent::Unrecognized { .. }));
}

#[test]
fn custom_policy_changes_mapping() {
    let policy = ProgressPolicy {
        bar_marker: "% [".to_string(),
        rate_markers: vec!["steps/s".to_string()],
        step_range: ProgressRange {
            start: 0.0,
            end: 50.0,
        },
        checkpoints: vec![Checkpoint::new("Warming up", 3.0)],
        complete_percent: 99.0,
    };
    let classifier = LineClassifier::new(policy);

    assert_close(
        classifier.classify("sampling 80% [=====>  ] 1.5 steps/s")[0]
            .percentage()
            .unwrap(),
        40.0,
    );
    assert_close(
        classifier.classify(r#"{"type":"status","message":"Warming up GPU"}"#)[1]
            .percentage()
            .unwrap(),
        3.0,
    );
    assert!(matches!(
        classifier.classify("  42%|████| 42/100 [4.20it/s]")[0],
        ClassifiedEvent::Unrecognized { .. }
    ));
}
