//! Integration tests for stagecraft pipelines.

mod common;

use async_trait::async_trait;
use serde_json::{json, Value};
use stagecraft::{
    start, CurrentStage, Pipeline, RetryPolicy, Retrying, RunOptions, RunStatus, Stage,
    StageAction, StageContext, StageError, StageState,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use common::{controlled, scripted, ProgressLog};

// Stage that doubles the number it was built with
struct DoubleStep {
    value: i64,
}

#[async_trait]
impl StageAction for DoubleStep {
    async fn run(&self, ctx: StageContext) -> Result<Value, StageError> {
        ctx.report(50.0);
        Ok(json!(self.value * 2))
    }
}

// Stage that fails N times then succeeds
struct FlakyStep {
    fail_count: AtomicU32,
    max_failures: u32,
}

#[async_trait]
impl StageAction for FlakyStep {
    async fn run(&self, _ctx: StageContext) -> Result<Value, StageError> {
        let count = self.fail_count.fetch_add(1, Ordering::SeqCst);
        if count < self.max_failures {
            Err(StageError::retryable(anyhow::anyhow!(
                "transient failure {}",
                count + 1
            )))
        } else {
            Ok(json!("deployed"))
        }
    }
}

#[tokio::test]
async fn test_simple_pipeline() {
    let pipeline = Pipeline::new("test")
        .stage(Stage::with_action("Double", DoubleStep { value: 21 }))
        .stage(scripted("Format", &[25.0, 75.0]))
        .build()
        .unwrap();

    let output = pipeline.start(RunOptions::new()).wait().await.unwrap();

    assert_eq!(output.stage_names(), vec!["Double", "Format"]);
    assert_eq!(output.get("Double"), Some(&json!(42)));
    assert_eq!(output.get("Format"), Some(&json!("Format")));
}

#[tokio::test]
async fn test_free_start_function() {
    let handle = start(
        vec![scripted("Analyze", &[50.0]), scripted("Plan", &[])],
        RunOptions::new(),
    )
    .unwrap();

    assert_eq!(handle.pipeline(), "pipeline");
    let output = handle.wait().await.unwrap();
    assert_eq!(output.len(), 2);
}

#[tokio::test]
async fn test_final_snapshot_after_success() {
    let pipeline = Pipeline::new("site_build")
        .stage(scripted("Analyze", &[10.0, 90.0]).describe("Reading the brief"))
        .stage(scripted("Generate", &[50.0]).weight(3.0))
        .build()
        .unwrap();

    let handle = pipeline.start(RunOptions::new());
    let mut updates = handle.subscribe();
    let id = handle.id();
    let output = handle.wait().await.unwrap();

    let run = updates.borrow_and_update().clone();
    assert_eq!(run.id, id);
    assert_eq!(run.pipeline, "site_build");
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.overall_progress, 100.0);
    assert_eq!(run.current_stage, CurrentStage::PastEnd);
    assert_eq!(
        run.stage_states(),
        vec![StageState::Completed, StageState::Completed]
    );
    assert_eq!(run.stage("Analyze").unwrap().description, "Reading the brief");
    assert_eq!(run.stage("Generate").unwrap().weight, 3.0);
    assert_eq!(run.result.as_ref(), Some(&output));
    assert!(run.error.is_none());
    assert!(run.started_at.is_some() && run.finished_at.is_some());
}

#[tokio::test]
async fn test_snapshot_tracks_active_stage() {
    let (analyze, analyze_remote) = controlled("Analyze");
    let (plan, plan_remote) = controlled("Plan");
    let handle = start(vec![analyze, plan], RunOptions::new()).unwrap();

    analyze_remote.report(40.0).await;
    let run = handle.snapshot();
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.current_stage, CurrentStage::At(0));
    assert_eq!(run.active_stage().map(|s| s.name.as_str()), Some("Analyze"));
    assert_eq!(run.stage("Analyze").unwrap().progress, 40.0);
    assert_eq!(run.stage("Plan").unwrap().state, StageState::Pending);
    assert_eq!(run.overall_progress, 20.0);
    assert!(run.result.is_none());

    analyze_remote.finish(json!("brief"));
    plan_remote.report(0.0).await;
    let run = handle.snapshot();
    assert_eq!(run.current_stage, CurrentStage::At(1));
    assert_eq!(
        run.stage_states(),
        vec![StageState::Completed, StageState::Active]
    );

    plan_remote.finish(json!("plan"));
    let output = handle.wait().await.unwrap();
    assert_eq!(output.get("Analyze"), Some(&json!("brief")));
}

#[tokio::test]
async fn test_built_pipeline_runs_are_fresh() {
    let pipeline = Pipeline::new("reusable")
        .stage(scripted("Analyze", &[100.0]))
        .build()
        .unwrap();

    let first = pipeline.start(RunOptions::new());
    let second = pipeline.start(RunOptions::new());
    assert_ne!(first.id(), second.id());

    assert!(first.wait().await.is_ok());
    assert!(second.wait().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_retry_is_done_by_wrapping_the_action() {
    let flaky = FlakyStep {
        fail_count: AtomicU32::new(0),
        max_failures: 2,
    };

    let pipeline = Pipeline::new("test_retry")
        .stage(scripted("Build", &[]))
        .stage(Stage::with_action(
            "Deploy",
            Retrying::new(flaky, RetryPolicy::fixed(3, Duration::from_millis(10))),
        ))
        .build()
        .unwrap();

    let output = pipeline.start(RunOptions::new()).wait().await.unwrap();
    assert_eq!(output.get("Deploy"), Some(&json!("deployed")));
}

#[tokio::test]
async fn test_progress_callback_names_active_stage() {
    let log = ProgressLog::default();
    let pipeline = Pipeline::new("named")
        .stage(scripted("Analyze", &[50.0]))
        .stage(scripted("Deploy", &[50.0]))
        .build()
        .unwrap();

    pipeline
        .start(RunOptions::new().on_progress(log.callback()))
        .wait()
        .await
        .unwrap();

    let calls = log.calls();
    // activate, report, complete for each stage
    assert_eq!(
        calls,
        vec![
            (0.0, "Analyze".to_string()),
            (25.0, "Analyze".to_string()),
            (50.0, "Analyze".to_string()),
            (50.0, "Deploy".to_string()),
            (75.0, "Deploy".to_string()),
            (100.0, "Deploy".to_string()),
        ]
    );
}
