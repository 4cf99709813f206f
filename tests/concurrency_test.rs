//! Independent runs share nothing: progress, snapshots and cancellation of one
//! run never leak into another.

mod common;

use serde_json::json;
use stagecraft::{start, Pipeline, RunOptions, RunStatus, StageState};
use std::collections::HashSet;

use common::{assert_non_decreasing, controlled, scripted, ProgressLog};

#[tokio::test]
async fn test_interleaved_runs_keep_separate_state() {
    let first_log = ProgressLog::default();
    let second_log = ProgressLog::default();

    let (a1, a1_remote) = controlled("Analyze");
    let (b1, b1_remote) = controlled("Generate");
    let (a2, a2_remote) = controlled("Analyze");
    let (b2, b2_remote) = controlled("Generate");

    let first = start(vec![a1, b1], RunOptions::new().on_progress(first_log.callback())).unwrap();
    let second =
        start(vec![a2, b2], RunOptions::new().on_progress(second_log.callback())).unwrap();

    a1_remote.report(50.0).await;
    a2_remote.finish(json!("second brief"));
    b2_remote.report(80.0).await;

    assert_eq!(first.snapshot().overall_progress, 25.0);
    assert_eq!(second.snapshot().overall_progress, 90.0);
    assert_eq!(first.snapshot().active_stage().unwrap().name, "Analyze");
    assert_eq!(second.snapshot().active_stage().unwrap().name, "Generate");

    // Cancelling the second run leaves the first untouched.
    second.cancel();
    let err = second.wait().await.unwrap_err();
    assert_eq!(err.stage_name(), Some("Generate"));
    assert_eq!(first.snapshot().status, RunStatus::Running);

    a1_remote.finish(json!("first brief"));
    b1_remote.finish(json!("first site"));
    let output = first.wait().await.unwrap();
    assert_eq!(output.get("Analyze"), Some(&json!("first brief")));

    assert!(first_log.calls().iter().all(|(_, stage)| stage == "Analyze" || stage == "Generate"));
    assert_eq!(first_log.last(), Some((100.0, "Generate".to_string())));
    assert_eq!(second_log.last(), Some((90.0, "Generate".to_string())));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_runs_of_one_pipeline() {
    let pipeline = Pipeline::new("fan")
        .stage(scripted("Analyze", &[10.0, 50.0, 90.0]))
        .stage(scripted("Plan", &[20.0, 40.0]).weight(0.5))
        .stage(scripted("Generate", &[5.0, 95.0]).weight(2.5))
        .build()
        .unwrap();

    let mut handles = Vec::new();
    let mut logs = Vec::new();
    for _ in 0..20 {
        let log = ProgressLog::default();
        handles.push(pipeline.start(RunOptions::new().on_progress(log.callback())));
        logs.push(log);
    }

    let ids: HashSet<_> = handles.iter().map(|handle| handle.id()).collect();
    assert_eq!(ids.len(), 20);

    for handle in handles {
        let updates = handle.subscribe();
        let output = handle.wait().await.unwrap();
        assert_eq!(output.stage_names(), vec!["Analyze", "Plan", "Generate"]);

        let run = updates.borrow().clone();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.stage_states(), vec![StageState::Completed; 3]);
    }

    let reference = logs[0].calls();
    for log in &logs {
        assert_non_decreasing(&log.values());
        assert_eq!(log.calls(), reference);
    }
}
