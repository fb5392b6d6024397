//! End-to-end tests for the process manager against real shell scripts.
//!
//! Scripts are run as `/bin/sh <script> --params-base64 <blob>` by passing the
//! script path as the marker flag, so `$2` inside a script is the blob.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shape_supervisor::config::SupervisorConfig;
use shape_supervisor::protocol::GenerationParameters;
use shape_supervisor::supervisor::{
    EventPump, ProcessManager, SessionState, SupervisorError, SupervisorEvent,
};
use tempfile::TempDir;

const SH: &str = "/bin/sh";

type Recorded = Arc<Mutex<Vec<SupervisorEvent>>>;

fn script(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("generator.sh");
    std::fs::write(&path, body).unwrap();
    path
}

fn config_for(script: &Path) -> SupervisorConfig {
    SupervisorConfig {
        marker_flag: script.display().to_string(),
        poll_interval_ms: 10,
        finish_grace_ms: 500,
        ..SupervisorConfig::default()
    }
}

fn manager_for(script: &Path) -> (ProcessManager, EventPump, Recorded) {
    let (manager, pump) = ProcessManager::new(config_for(script)).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager
        .subscribers()
        .subscribe_all(move |event| sink.lock().unwrap().push(event.clone()));
    (manager, pump, seen)
}

fn params() -> GenerationParameters {
    GenerationParameters::new("a small wooden chair").karras_steps(16)
}

/// Pump events until the first `ProcessFinished`, then give any stray
/// notifications time to arrive and deliver them too.
async fn pump_until_finished(pump: &mut EventPump, seen: &Recorded) -> Vec<SupervisorEvent> {
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = pump.next().await {
            if event == SupervisorEvent::ProcessFinished {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for ProcessFinished");

    tokio::time::sleep(Duration::from_millis(200)).await;
    pump.drain();
    seen.lock().unwrap().clone()
}

async fn pump_until(pump: &mut EventPump, wanted: impl Fn(&SupervisorEvent) -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = pump.next().await {
            if wanted(&event) {
                return;
            }
        }
    })
    .await
    .expect("timed out waiting for event");
}

fn finished_count(events: &[SupervisorEvent]) -> usize {
    events
        .iter()
        .filter(|e| **e == SupervisorEvent::ProcessFinished)
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn complete_run_reports_progress_then_finishes_once() {
    let dir = tempfile::tempdir().unwrap();
    let script = script(
        &dir,
        r#"echo "{\"type\":\"info\",\"message\":\"$2\"}"
echo '{"type":"status","message":"Loading models..."}'
printf ' 50%%|#####     | 8/16 [00:05<00:05, 1.60it/s]\r'
printf '100%%|##########| 16/16 [00:10<00:00, 1.60it/s]\n'
echo '{"type":"complete","ply_file":"/out/chair.ply","obj_file":"/out/chair.obj"}'
"#,
    );
    let (manager, mut pump, seen) = manager_for(&script);

    let session = manager.launch(SH, &params()).unwrap();
    let events = pump_until_finished(&mut pump, &seen).await;

    // The child received the encoded parameters.
    match &events[0] {
        SupervisorEvent::Info { message } => {
            let decoded = GenerationParameters::decode(message).unwrap();
            assert_eq!(decoded, params());
        }
        other => panic!("Expected Info with the blob, got {other:?}"),
    }

    let percentages: Vec<f32> = events
        .iter()
        .filter_map(|e| match e {
            SupervisorEvent::Progress(update) => Some(update.percentage),
            _ => None,
        })
        .collect();
    assert_eq!(percentages.len(), 4);
    for (actual, expected) in percentages.iter().zip([1.0, 52.5, 95.0, 100.0]) {
        assert!((actual - expected).abs() < 1e-3, "{actual} != {expected}");
    }

    let complete = events
        .iter()
        .position(|e| matches!(e, SupervisorEvent::Complete { .. }))
        .expect("Complete event");
    assert_eq!(
        events[complete],
        SupervisorEvent::Complete {
            primary_output: Some("/out/chair.ply".to_string()),
            secondary_output: Some("/out/chair.obj".to_string()),
            raw_line: r#"{"type":"complete","ply_file":"/out/chair.ply","obj_file":"/out/chair.obj"}"#
                .to_string(),
        }
    );
    assert_eq!(events.last(), Some(&SupervisorEvent::ProcessFinished));
    assert_eq!(finished_count(&events), 1);

    assert!(!manager.is_running());
    assert_eq!(manager.state(), SessionState::Idle);
    assert_eq!(manager.current_session(), None);
    assert_eq!(session.0, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_record_ends_session_while_child_lingers() {
    let dir = tempfile::tempdir().unwrap();
    let script = script(
        &dir,
        r#"echo '{"type":"error","message":"CUDA out of memory","error_type":"RuntimeError"}'
sleep 30
"#,
    );
    let (manager, mut pump, seen) = manager_for(&script);

    manager.launch(SH, &params()).unwrap();
    let events = pump_until_finished(&mut pump, &seen).await;

    assert!(events.iter().any(|e| matches!(
        e,
        SupervisorEvent::Error { message, error_kind, .. }
            if message == "CUDA out of memory" && error_kind == "RuntimeError"
    )));
    assert_eq!(finished_count(&events), 1);
    assert!(!manager.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_exit_finishes_without_error() {
    let dir = tempfile::tempdir().unwrap();
    let script = script(&dir, "echo 'warming up without telling anyone'\nexit 3\n");
    let (manager, mut pump, seen) = manager_for(&script);

    manager.launch(SH, &params()).unwrap();
    let events = pump_until_finished(&mut pump, &seen).await;

    assert_eq!(events, vec![SupervisorEvent::ProcessFinished]);
    assert_eq!(manager.stats().finished, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stderr_records_are_classified() {
    let dir = tempfile::tempdir().unwrap();
    let script = script(
        &dir,
        r#"echo '{"type":"status","message":"Models loaded."}' >&2
sleep 0.2
echo '{"type":"complete","ply_file":"a.ply","obj_file":"a.obj"}'
"#,
    );
    let (manager, mut pump, seen) = manager_for(&script);

    manager.launch(SH, &params()).unwrap();
    let events = pump_until_finished(&mut pump, &seen).await;

    assert!(events.contains(&SupervisorEvent::Status {
        message: "Models loaded.".to_string()
    }));
    assert_eq!(finished_count(&events), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_stop_kills_child_and_finishes_once() {
    let dir = tempfile::tempdir().unwrap();
    let script = script(
        &dir,
        "echo '{\"type\":\"status\",\"message\":\"Generating latents...\"}'\nsleep 30\n",
    );
    let (manager, mut pump, seen) = manager_for(&script);

    manager.launch(SH, &params()).unwrap();
    pump_until(&mut pump, |e| matches!(e, SupervisorEvent::Status { .. })).await;
    assert!(manager.is_running());
    let pid = manager.current_pid().expect("pid of running child");

    manager.request_stop();
    assert!(!manager.is_running());
    manager.request_stop();

    let events = pump_until_finished(&mut pump, &seen).await;
    assert_eq!(finished_count(&events), 1);
    assert_eq!(manager.state(), SessionState::Idle);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let alive = std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .unwrap()
        .success();
    assert!(!alive, "child {pid} survived request_stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn launch_while_running_is_busy_and_leaves_session_alone() {
    let dir = tempfile::tempdir().unwrap();
    let script = script(&dir, "sleep 30\n");
    let (manager, mut pump, seen) = manager_for(&script);

    let first = manager.launch(SH, &params()).unwrap();
    let err = manager.launch(SH, &params()).unwrap_err();

    assert!(matches!(err, SupervisorError::ProcessBusy));
    assert_eq!(manager.current_session(), Some(first));
    assert!(manager.is_running());

    pump_until(&mut pump, |e| matches!(e, SupervisorEvent::Error { .. })).await;
    assert!(seen.lock().unwrap().iter().any(|e| matches!(
        e,
        SupervisorEvent::Error { error_kind, .. } if error_kind == "ProcessBusy"
    )));

    manager.request_stop();
    let events = pump_until_finished(&mut pump, &seen).await;
    assert_eq!(finished_count(&events), 1);
    assert_eq!(manager.stats().launches, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manager_is_reusable_after_a_session() {
    let dir = tempfile::tempdir().unwrap();
    let script = script(
        &dir,
        "echo '{\"type\":\"complete\",\"ply_file\":\"a.ply\",\"obj_file\":\"a.obj\"}'\n",
    );
    let (manager, mut pump, seen) = manager_for(&script);

    let first = manager.launch(SH, &params()).unwrap();
    pump_until_finished(&mut pump, &seen).await;
    seen.lock().unwrap().clear();

    let second = manager.launch(SH, &params()).unwrap();
    let events = pump_until_finished(&mut pump, &seen).await;

    assert_ne!(first, second);
    assert_eq!(finished_count(&events), 1);
    let stats = manager.stats();
    assert_eq!(stats.launches, 2);
    assert_eq!(stats.finished, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_from_subscriber_callback() {
    let dir = tempfile::tempdir().unwrap();
    let script = script(
        &dir,
        "echo '{\"type\":\"status\",\"message\":\"Loading models...\"}'\nsleep 30\n",
    );
    let (manager, mut pump, seen) = manager_for(&script);
    let stop = manager.stop_handle();
    manager.subscribers().on_status(move |_| stop.request_stop());

    manager.launch(SH, &params()).unwrap();
    let events = pump_until_finished(&mut pump, &seen).await;

    assert_eq!(finished_count(&events), 1);
    assert!(!manager.is_running());
    assert!(!manager.stop_handle().is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_manager_stops_session() {
    let dir = tempfile::tempdir().unwrap();
    let script = script(&dir, "sleep 30\n");
    let (manager, mut pump, seen) = manager_for(&script);

    manager.launch(SH, &params()).unwrap();
    drop(manager);

    // Every dispatcher is gone once the manager is, so the pump runs dry.
    tokio::time::timeout(Duration::from_secs(10), async {
        while pump.next().await.is_some() {}
    })
    .await
    .expect("pump did not close after manager drop");

    assert_eq!(finished_count(&seen.lock().unwrap()), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_launcher_is_file_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let config = SupervisorConfig {
        launcher: Some("run_shape.sh".to_string()),
        ..SupervisorConfig::default()
    };
    let (manager, mut pump) = ProcessManager::new(config).unwrap();

    let err = manager
        .launch(dir.path().join("interface.py"), &params())
        .unwrap_err();

    match err {
        SupervisorError::FileNotFound(path) => assert!(path.ends_with("run_shape.sh")),
        other => panic!("Expected FileNotFound, got {other:?}"),
    }
    assert_eq!(manager.state(), SessionState::Idle);
    assert_eq!(pump.drain(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_racing_completion_finishes_each_session_once() {
    const ROUNDS: usize = 40;
    let dir = tempfile::tempdir().unwrap();
    let script = script(
        &dir,
        "echo '{\"type\":\"complete\",\"ply_file\":\"a.ply\",\"obj_file\":\"a.obj\"}'\n",
    );
    let (manager, mut pump, seen) = manager_for(&script);

    for round in 0..ROUNDS {
        manager.launch(SH, &params()).unwrap();
        let delay = u64::try_from(round % 8).unwrap();
        tokio::time::sleep(Duration::from_millis(delay)).await;
        manager.request_stop();
        assert!(!manager.is_running());
        assert_eq!(manager.state(), SessionState::Idle);
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    pump.drain();

    let events = seen.lock().unwrap().clone();
    assert_eq!(finished_count(&events), ROUNDS);
    let stats = manager.stats();
    assert_eq!(stats.launches, ROUNDS);
    assert_eq!(stats.finished, ROUNDS);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_finite_parameters_fail_launch_without_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let script = script(&dir, "sleep 30\n");
    let (manager, mut pump, seen) = manager_for(&script);

    let err = manager
        .launch(SH, &params().guidance_scale(f32::NAN))
        .unwrap_err();

    assert!(matches!(err, SupervisorError::InvalidParameters(_)));
    assert_eq!(manager.state(), SessionState::Idle);
    assert_eq!(manager.current_pid(), None);
    pump.drain();
    assert!(seen.lock().unwrap().iter().any(|e| matches!(
        e,
        SupervisorEvent::Error { error_kind, .. } if error_kind == "InvalidParameters"
    )));
}
