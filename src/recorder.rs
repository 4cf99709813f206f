//! Recording interface for run history.
//!
//! A recorder is a sink: the engine reports lifecycle events to it and logs,
//! but otherwise ignores, any error it returns.

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::state::RunId;

/// How a stage ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    /// Stage completed successfully.
    Completed,
    /// Stage action failed.
    Failed { error: String },
    /// Run was cancelled while the stage was in flight.
    Cancelled,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunConclusion {
    /// Every stage completed.
    Completed,
    /// A stage failed.
    Failed { stage: String, error: String },
    /// The run was cancelled, possibly while `stage` was in flight.
    Cancelled { stage: Option<String> },
}

/// Records run execution for observability.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Record the start of a run.
    async fn start_run(&self, run_id: RunId, pipeline: &str, stage_count: usize)
        -> anyhow::Result<()>;

    /// Record the activation of a stage.
    async fn start_stage(
        &self,
        run_id: RunId,
        stage_name: &str,
        stage_index: usize,
    ) -> anyhow::Result<()>;

    /// Record the end of a stage.
    async fn complete_stage(
        &self,
        run_id: RunId,
        stage_index: usize,
        status: StageStatus,
    ) -> anyhow::Result<()>;

    /// Record the end of a run.
    async fn complete_run(&self, run_id: RunId, conclusion: RunConclusion) -> anyhow::Result<()>;
}

/// A no-op recorder that discards all events.
///
/// Useful for testing or when persistence is not needed.
#[derive(Debug, Clone, Default)]
pub struct NoopRecorder;

impl NoopRecorder {
    /// Create a new no-op recorder.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Recorder for NoopRecorder {
    async fn start_run(
        &self,
        _run_id: RunId,
        _pipeline: &str,
        _stage_count: usize,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn start_stage(
        &self,
        _run_id: RunId,
        _stage_name: &str,
        _stage_index: usize,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn complete_stage(
        &self,
        _run_id: RunId,
        _stage_index: usize,
        _status: StageStatus,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn complete_run(&self, _run_id: RunId, _conclusion: RunConclusion) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Recorder that emits lifecycle events as `tracing` events.
///
/// The engine logs the same transitions at `debug` only; this recorder is
/// what puts them at `info` and above.
#[derive(Debug, Clone, Default)]
pub struct TracingRecorder;

#[async_trait]
impl Recorder for TracingRecorder {
    async fn start_run(&self, run_id: RunId, pipeline: &str, stage_count: usize) -> anyhow::Result<()> {
        info!(%run_id, pipeline, stage_count, "Run started");
        Ok(())
    }

    async fn start_stage(
        &self,
        run_id: RunId,
        stage_name: &str,
        stage_index: usize,
    ) -> anyhow::Result<()> {
        info!(%run_id, stage = stage_name, stage_index, "Stage started");
        Ok(())
    }

    async fn complete_stage(
        &self,
        run_id: RunId,
        stage_index: usize,
        status: StageStatus,
    ) -> anyhow::Result<()> {
        match status {
            StageStatus::Completed => info!(%run_id, stage_index, "Stage completed"),
            StageStatus::Failed { error } => {
                error!(%run_id, stage_index, error = %error, "Stage failed")
            }
            StageStatus::Cancelled => warn!(%run_id, stage_index, "Stage interrupted"),
        }
        Ok(())
    }

    async fn complete_run(&self, run_id: RunId, conclusion: RunConclusion) -> anyhow::Result<()> {
        match conclusion {
            RunConclusion::Completed => info!(%run_id, "Run completed"),
            RunConclusion::Failed { stage, error } => {
                error!(%run_id, stage = %stage, error = %error, "Run failed")
            }
            RunConclusion::Cancelled { stage } => {
                warn!(%run_id, stage = ?stage, "Run cancelled")
            }
        }
        Ok(())
    }
}
