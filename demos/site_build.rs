//! Website builder walkthrough for the stagecraft engine.
//!
//! ```bash
//! RUST_LOG=stagecraft=debug cargo run --example site_build
//! ```
//!
//! This example demonstrates:
//! - Classifying a free-text brief with the keyword classifier
//! - Weighted stages with progress reports
//! - Wrapping a flaky action in `Retrying` and a slow one in `WithTimeout`
//! - Rendering the `on_progress` callback as a progress bar
//! - Cancelling a run from the outside

use async_trait::async_trait;
use serde_json::{json, Value};
use stagecraft::{
    ClassifyAction, KeywordClassifier, Pipeline, RetryPolicy, Retrying, RunError, RunOptions,
    Stage, StageAction, StageContext, StageError, TracingRecorder, WithTimeout,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Simulated work: `steps` ticks of `tick` each, reporting as it goes.
async fn simulate(ctx: &StageContext, steps: u32, tick: Duration) {
    for step in 1..=steps {
        tokio::time::sleep(tick).await;
        ctx.report(f64::from(step) / f64::from(steps) * 100.0);
    }
}

/// Step 2: Turn the classification into a page plan.
async fn plan(ctx: StageContext) -> Result<Value, StageError> {
    simulate(&ctx, 4, Duration::from_millis(60)).await;
    Ok(json!({ "pages": ["home", "about", "contact"] }))
}

/// Step 3: Generate the site. The heaviest stage.
async fn generate(ctx: StageContext) -> Result<Value, StageError> {
    simulate(&ctx, 10, Duration::from_millis(80)).await;
    Ok(json!({ "files": 12 }))
}

/// Step 4: Review the generated pages.
async fn review(ctx: StageContext) -> Result<Value, StageError> {
    simulate(&ctx, 3, Duration::from_millis(50)).await;
    Ok(json!({ "issues": 0 }))
}

/// Step 5: Deploy. Fails transiently on the first attempt.
struct DeployStep {
    attempts: AtomicU32,
}

#[async_trait]
impl StageAction for DeployStep {
    async fn run(&self, ctx: StageContext) -> Result<Value, StageError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        simulate(&ctx, 2, Duration::from_millis(40)).await;
        if attempt == 1 {
            println!("\n[deploy] upload interrupted, will retry");
            return Err(StageError::retryable(anyhow::anyhow!("connection reset")));
        }
        Ok(json!({ "url": "https://example.invalid/site", "attempt": attempt }))
    }
}

fn build_pipeline(brief: &str) -> anyhow::Result<stagecraft::BuiltPipeline> {
    let classifier = Arc::new(KeywordClassifier::default());

    let pipeline = Pipeline::new("site_build")
        .stage(
            Stage::with_action(
                "Analyze",
                ClassifyAction::new(classifier, brief).with_timeout(Duration::from_secs(5)),
            )
            .describe("Understanding your brief")
            .weight(0.5),
        )
        .stage(Stage::from_fn("Plan", plan).describe("Planning pages"))
        .stage(
            Stage::with_action(
                "Generate",
                WithTimeout::new(stagecraft::FnAction::new(generate), Duration::from_secs(30)),
            )
            .describe("Generating content")
            .weight(3.0),
        )
        .stage(Stage::from_fn("Review", review).describe("Reviewing"))
        .stage(
            Stage::with_action(
                "Deploy",
                Retrying::new(
                    DeployStep {
                        attempts: AtomicU32::new(0),
                    },
                    RetryPolicy::fixed(3, Duration::from_millis(100)),
                ),
            )
            .describe("Publishing"),
        )
        .with_recorder(TracingRecorder)
        .build()?;

    Ok(pipeline)
}

fn render(overall: f64, stage: &str) {
    let filled = (overall / 5.0).round() as usize;
    print!(
        "\r[{}{}] {:>5.1}% {:<10}",
        "#".repeat(filled),
        " ".repeat(20 - filled.min(20)),
        overall,
        stage
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    println!("=== Stagecraft - Site Build Example ===\n");

    let brief = "A portfolio site for my photography with a gallery and a contact form, in blue";

    // Example 1: A full run
    println!("--- Example 1: Full run ---");
    let pipeline = build_pipeline(brief)?;
    let output = pipeline
        .start(RunOptions::new().on_progress(render))
        .wait()
        .await?;

    println!("\n\nStages: {}", output.stage_names().join(" -> "));
    if let Some(analysis) = output.get("Analyze") {
        println!("Analysis: {}", analysis);
    }
    if let Some(deploy) = output.get("Deploy") {
        println!("Deployed: {}\n", deploy);
    }

    // Example 2: Cancel while generating
    println!("--- Example 2: Cancel during Generate ---");
    let pipeline = build_pipeline(brief)?;
    let handle = pipeline.start(RunOptions::new().on_progress(render));
    let mut updates = handle.subscribe();
    updates
        .wait_for(|run| {
            run.active_stage()
                .is_some_and(|stage| stage.name == "Generate" && stage.progress >= 30.0)
        })
        .await?;
    handle.cancel();

    match handle.wait().await {
        Err(RunError::Cancelled { stage }) => {
            println!("\n\nCancelled during {:?}", stage);
        }
        Err(e) => eprintln!("\n\nPipeline failed: {}", e),
        Ok(_) => println!("\n\nFinished before the cancel landed"),
    }

    let last = updates.borrow().clone();
    println!("Final status: {} at {:.1}%", last.status, last.overall_progress);

    Ok(())
}
