//! End-to-end orchestration: launcher, supervisor, watchdog and live streams
//! against real `sh` processes.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use qa_orchestrator::api::state::AppState;
use qa_orchestrator::config::OrchestratorConfig;
use qa_orchestrator::runner::RunOptions;
use qa_orchestrator::storage::{open_pool, CommandSpec, NewTestCase, RunStatus, TestCase};
use qa_orchestrator::stream::StreamEvent;
use tokio::sync::mpsc;

struct Harness {
    _dir: tempfile::TempDir,
    state: AppState,
}

fn harness(max_run_seconds: u64, grace_seconds: u64) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = OrchestratorConfig::default();
    config.storage.database_path = dir.path().join("orchestrator.db");
    config.storage.artifacts_root = dir.path().join("artifacts");
    config.runner.max_run_seconds = max_run_seconds;
    config.runner.grace_seconds = grace_seconds;
    config.runner.env.insert("AMBIENT".into(), "from-config".into());
    config.runner.env.insert("SHARED".into(), "from-config".into());
    config.stream.poll_interval_ms = 100;
    std::fs::create_dir_all(&config.storage.artifacts_root).unwrap();

    let pool = open_pool(&config.storage.database_path).unwrap();
    Harness {
        _dir: dir,
        state: AppState::new(pool, &config),
    }
}

fn shell_case(h: &Harness, name: &str, script: &str) -> TestCase {
    let mut command = CommandSpec::new("checkout.spec.ts");
    command.program = "sh".to_string();
    command.args = vec!["-c".to_string(), script.to_string()];
    h.state
        .cases
        .create(NewTestCase {
            name: name.to_string(),
            command,
            env: BTreeMap::new(),
            actions: Vec::new(),
        })
        .unwrap()
}

async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("stream stalled")
    {
        events.push(event);
    }
    events
}

fn lines(events: &[StreamEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Line { line } => Some(line.clone()),
            _ => None,
        })
        .collect()
}

fn done_status(events: &[StreamEvent]) -> (RunStatus, Option<i32>) {
    match events.last() {
        Some(StreamEvent::Done { run }) => (run.status, run.exit_code),
        other => panic!("expected done as the last event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_exit_zero_passes_and_stream_ends_with_done() {
    let h = harness(60, 5);
    let case = shell_case(&h, "green", "echo hello; echo world");

    let (ticket, completion) = h
        .state
        .launcher
        .start_run(&case.id, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(ticket.artifacts_url, format!("/artifacts/{}", ticket.run_id));
    assert!(ticket.artifacts_dir.is_dir());

    let events = collect(h.state.publisher.subscribe(ticket.run_id.clone())).await;
    let out = lines(&events);
    assert!(out.iter().any(|l| l == "hello"));
    assert!(out.iter().any(|l| l == "world"));
    assert!(out.iter().any(|l| l == "Process exited with code 0"));
    assert_eq!(done_status(&events), (RunStatus::Passed, Some(0)));

    // Only one done, and nothing after it.
    let dones = events.iter().filter(|e| matches!(e, StreamEvent::Done { .. })).count();
    assert_eq!(dones, 1);

    let record = completion.await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Passed);
    assert!(record.started_at.is_some());
    assert!(record.finished_at.is_some());
}

#[tokio::test]
async fn test_nonzero_exit_fails_with_code() {
    let h = harness(60, 5);
    let case = shell_case(&h, "red", "echo 'assertion failed' >&2; exit 7");

    let (ticket, completion) = h
        .state
        .launcher
        .start_run(&case.id, RunOptions::default())
        .await
        .unwrap();
    let record = completion.await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.exit_code, Some(7));

    let log = std::fs::read_to_string(&record.log_path).unwrap();
    assert!(log.contains("assertion failed"));
    assert!(log.contains("Process exited with code 7"));

    let stored = h.state.runs.get(&ticket.run_id).unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.exit_code, Some(7));
    assert!(stored.error.is_none());
}

#[tokio::test]
async fn test_watchdog_escalates_to_sigkill() {
    let h = harness(2, 1);
    let case = shell_case(&h, "stuck", "trap '' TERM; echo started; sleep 30");

    let started = Instant::now();
    let (ticket, _completion) = h
        .state
        .launcher
        .start_run(&case.id, RunOptions::default())
        .await
        .unwrap();
    let events = collect(h.state.publisher.subscribe(ticket.run_id.clone())).await;
    let elapsed = started.elapsed();

    assert_eq!(done_status(&events), (RunStatus::Error, None));
    assert!(elapsed >= Duration::from_secs(2), "took {elapsed:?}");
    assert!(elapsed < Duration::from_secs(8), "took {elapsed:?}");

    let out = lines(&events);
    assert!(out.iter().any(|l| l.contains("[WATCHDOG] Exceeded 2s. Sending SIGTERM")));
    assert!(out.iter().any(|l| l.contains("[WATCHDOG] Forcing SIGKILL")));
    assert!(out.iter().any(|l| l == "Process exited with code null"));

    let record = h.state.runs.get(&ticket.run_id).unwrap().unwrap();
    assert_eq!(record.error.as_deref(), Some("killed by watchdog after 2s"));
}

#[tokio::test]
async fn test_watchdog_sigterm_is_enough_for_cooperative_process() {
    let h = harness(1, 5);
    let case = shell_case(&h, "slow", "sleep 30");

    let (_ticket, completion) = h
        .state
        .launcher
        .start_run(&case.id, RunOptions::default())
        .await
        .unwrap();
    let record = tokio::time::timeout(Duration::from_secs(10), completion)
        .await
        .expect("watchdog did not stop the run")
        .unwrap()
        .unwrap();

    assert_eq!(record.status, RunStatus::Error);
    assert_eq!(record.exit_code, None);
    let log = std::fs::read_to_string(&record.log_path).unwrap();
    assert!(log.contains("Sending SIGTERM"));
    assert!(!log.contains("Forcing SIGKILL"));
}

#[tokio::test]
async fn test_late_subscriber_replays_backlog_in_order() {
    let h = harness(60, 5);
    let case = shell_case(&h, "chatty", "i=1; while [ $i -le 50 ]; do echo line-$i; i=$((i+1)); done");

    let (ticket, completion) = h
        .state
        .launcher
        .start_run(&case.id, RunOptions::default())
        .await
        .unwrap();
    completion.await.unwrap().unwrap();

    let events = collect(h.state.publisher.subscribe(ticket.run_id.clone())).await;
    let expected: Vec<String> = (1..=50).map(|i| format!("line-{i}")).collect();
    let got: Vec<String> = lines(&events)
        .into_iter()
        .filter(|l| l.starts_with("line-"))
        .collect();
    assert_eq!(got, expected);

    // Backlog first: every line precedes the first heartbeat.
    let first_status = events
        .iter()
        .position(|e| matches!(e, StreamEvent::Status { .. }))
        .unwrap();
    let last_line = events
        .iter()
        .rposition(|e| matches!(e, StreamEvent::Line { .. }))
        .unwrap();
    assert!(last_line < first_status);
    assert_eq!(done_status(&events), (RunStatus::Passed, Some(0)));
}

#[tokio::test]
async fn test_two_subscribers_see_identical_done() {
    let h = harness(60, 5);
    let case = shell_case(&h, "brief", "echo one; sleep 1; echo two");

    let (ticket, _completion) = h
        .state
        .launcher
        .start_run(&case.id, RunOptions::default())
        .await
        .unwrap();
    let a = h.state.publisher.subscribe(ticket.run_id.clone());
    let b = h.state.publisher.subscribe(ticket.run_id.clone());
    let (a, b) = tokio::join!(collect(a), collect(b));

    assert_eq!(a.last(), b.last());
    assert_eq!(done_status(&a), (RunStatus::Passed, Some(0)));
    assert_eq!(lines(&a), lines(&b));
}

#[tokio::test]
async fn test_heartbeats_never_go_backwards() {
    let h = harness(60, 5);
    let case = shell_case(&h, "steady", "echo tick; sleep 1; echo tock");

    let (ticket, _completion) = h
        .state
        .launcher
        .start_run(&case.id, RunOptions::default())
        .await
        .unwrap();
    let events = collect(h.state.publisher.subscribe(ticket.run_id.clone())).await;

    let statuses: Vec<RunStatus> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Status { status, .. } => Some(*status),
            _ => None,
        })
        .collect();
    assert!(!statuses.is_empty());
    for pair in statuses.windows(2) {
        assert!(
            pair[0] == pair[1] || pair[0].can_transition_to(pair[1]),
            "status went from {} to {}",
            pair[0],
            pair[1]
        );
    }
    assert_eq!(*statuses.last().unwrap(), RunStatus::Passed);
}

#[tokio::test]
async fn test_unknown_run_stream_is_single_error() {
    let h = harness(60, 5);
    let events = collect(h.state.publisher.subscribe("does-not-exist")).await;
    assert_eq!(
        events,
        vec![StreamEvent::Error {
            error: "Run not found".to_string()
        }]
    );
}

#[tokio::test]
async fn test_environment_precedence_and_actions() {
    let h = harness(60, 5);
    let mut command = CommandSpec::new("cart.spec.ts");
    command.program = "sh".to_string();
    command.args = vec![
        "-c".to_string(),
        "echo \"AMBIENT=$AMBIENT SHARED=$SHARED OVERRIDE=$OVERRIDE ACTIONS=$QA_ACTIONS\"; test -d \"$ARTIFACTS_RUN_DIR\"".to_string(),
    ];
    let case = h
        .state
        .cases
        .create(NewTestCase {
            name: "env".to_string(),
            command,
            env: BTreeMap::from([
                ("SHARED".to_string(), "from-case".to_string()),
                ("OVERRIDE".to_string(), "from-case".to_string()),
            ]),
            actions: vec!["login".to_string(), "add_to_cart".to_string()],
        })
        .unwrap();

    let options = RunOptions {
        headed: false,
        env: BTreeMap::from([("OVERRIDE".to_string(), "from-run".to_string())]),
    };
    let (_ticket, completion) = h.state.launcher.start_run(&case.id, options).await.unwrap();
    let record = completion.await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Passed);

    let log = std::fs::read_to_string(&record.log_path).unwrap();
    assert!(
        log.contains("AMBIENT=from-config SHARED=from-case OVERRIDE=from-run ACTIONS=login,add_to_cart"),
        "unexpected log: {log}"
    );
}

#[tokio::test]
async fn test_case_edit_does_not_touch_inflight_run() {
    let h = harness(60, 5);
    let case = shell_case(&h, "editable", "sleep 1; echo original");

    let (_ticket, completion) = h
        .state
        .launcher
        .start_run(&case.id, RunOptions::default())
        .await
        .unwrap();
    h.state
        .cases
        .update(
            &case.id,
            qa_orchestrator::storage::CasePatch {
                name: Some("renamed".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    h.state.cases.delete(&case.id).unwrap();

    let record = completion.await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Passed);
    assert_eq!(record.test_case_id, case.id);
    let log = std::fs::read_to_string(&record.log_path).unwrap();
    assert!(log.contains("original"));
    assert!(log.contains("for case \"editable\""));
}
