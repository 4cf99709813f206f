//! # Stagecraft
//!
//! Staged progress pipelines for long-running, user-facing jobs.
//!
//! A pipeline is an ordered list of named stages. Each stage runs an async
//! action that reports its own progress; the engine runs them one at a time,
//! folds their progress into a single weighted percentage, and finishes with
//! either every stage's payload or the first failure.
//!
//! - **Sequential** - a stage starts only after the previous one succeeded
//! - **Weighted progress** - `Σ completed weights + active weight × progress`,
//!   never decreasing
//! - **Observable** - read-only snapshots over a `watch` channel, an
//!   `on_progress` callback, and an optional [`Recorder`]
//! - **Cooperative cancellation** - the run stops sequencing; in-flight
//!   actions decide for themselves whether to stop
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stagecraft::{Pipeline, RunOptions, Stage, StageContext};
//! use serde_json::json;
//!
//! let pipeline = Pipeline::new("site_build")
//!     .stage(Stage::from_fn("Analyze", |ctx: StageContext| async move {
//!         ctx.report(50.0);
//!         Ok(json!({ "intent": "portfolio" }))
//!     }))
//!     .stage(Stage::from_fn("Generate", generate).weight(3.0))
//!     .build()?;
//!
//! let handle = pipeline.start(RunOptions::new().on_progress(|overall, stage| {
//!     println!("{overall:>5.1}% {stage}");
//! }));
//! let output = handle.wait().await?;
//! ```
//!
//! ## Wrapping actions
//!
//! The engine never retries and never times out. Wrap an action instead:
//!
//! ```rust,ignore
//! let deploy = Stage::with_action(
//!     "Deploy",
//!     WithTimeout::new(
//!         Retrying::new(DeployAction, RetryPolicy::exponential(3)),
//!         Duration::from_secs(120),
//!     ),
//! );
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` - Enable SQLite-backed run history

pub mod classifier;
pub mod pipeline;
pub mod recorder;
pub mod retry;
pub mod signal;
pub mod stage;
pub mod state;
pub mod timeout;

pub use classifier::{
    Classification, ClassificationError, ClassifyAction, Entity, EntityRule, IntentRule,
    KeywordClassifier, KeywordRules, RequirementRule, TextClassifier,
};
pub use pipeline::{
    start, BuiltPipeline, ConfigurationError, Pipeline, ProgressCallback, RunError, RunHandle,
    RunOptions,
};
pub use recorder::{NoopRecorder, Recorder, RunConclusion, StageStatus, TracingRecorder};
pub use retry::{RetryPolicy, Retrying};
pub use signal::CancelSignal;
pub use stage::{FnAction, Stage, StageAction, StageContext, StageError};
pub use state::{
    CurrentStage, PipelineRun, RunFailure, RunId, RunOutput, RunStatus, StageOutput,
    StageSnapshot, StageState,
};
pub use timeout::WithTimeout;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteRecorder;
