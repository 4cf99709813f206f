//! Run snapshots and the per-run state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::stage::Stage;

/// Unique identifier for a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a fresh run id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Top-level status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Completed, failed and cancelled runs never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Active,
    Completed,
    Failed,
}

/// Where the run's cursor is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "index", rename_all = "snake_case")]
pub enum CurrentStage {
    NotStarted,
    At(usize),
    PastEnd,
}

/// Observable state of one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSnapshot {
    pub name: String,
    pub description: String,
    pub weight: f64,
    pub state: StageState,
    /// The stage's own progress, 0-100.
    pub progress: f64,
}

/// Payload produced by one completed stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageOutput {
    pub stage: String,
    pub payload: Value,
}

/// Aggregated result of a completed run, in stage order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunOutput {
    pub stages: Vec<StageOutput>,
}

impl RunOutput {
    /// Payload of the named stage.
    pub fn get(&self, stage: &str) -> Option<&Value> {
        self.stages
            .iter()
            .find(|output| output.stage == stage)
            .map(|output| &output.payload)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage names in the order they ran.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|output| output.stage.as_str()).collect()
    }
}

/// Which stage failed and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    pub stage_name: String,
    pub cause: String,
}

/// Read-only snapshot of a run, handed to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub pipeline: String,
    pub stages: Vec<StageSnapshot>,
    pub current_stage: CurrentStage,
    /// Weighted aggregate, 0-100, never decreasing.
    pub overall_progress: f64,
    pub status: RunStatus,
    /// Set only when `status` is `Completed`.
    pub result: Option<RunOutput>,
    /// Set only when `status` is `Failed`.
    pub error: Option<RunFailure>,
    /// Stage that was in flight when the run was cancelled, if any.
    pub interrupted_stage: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Look up a stage by name.
    pub fn stage(&self, name: &str) -> Option<&StageSnapshot> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    /// The stage currently executing.
    pub fn active_stage(&self) -> Option<&StageSnapshot> {
        match self.current_stage {
            CurrentStage::At(index) => self
                .stages
                .get(index)
                .filter(|stage| stage.state == StageState::Active),
            _ => None,
        }
    }

    /// Per-stage states in pipeline order.
    pub fn stage_states(&self) -> Vec<StageState> {
        self.stages.iter().map(|stage| stage.state).collect()
    }
}

/// Mutable run state. Owned by the engine; every transition checks its
/// preconditions and returns whether it was applied.
#[derive(Debug)]
pub(crate) struct RunState {
    run: PipelineRun,
    total_weight: f64,
    outputs: Vec<StageOutput>,
}

impl RunState {
    /// `stages` must already be validated: non-empty, positive total weight.
    pub(crate) fn new(id: RunId, pipeline: &str, stages: &[Stage]) -> Self {
        let stages: Vec<StageSnapshot> = stages
            .iter()
            .map(|stage| StageSnapshot {
                name: stage.name().to_string(),
                description: stage.description().to_string(),
                weight: stage.effective_weight(),
                state: StageState::Pending,
                progress: 0.0,
            })
            .collect();
        let total_weight = stages.iter().map(|stage| stage.weight).sum();

        Self {
            run: PipelineRun {
                id,
                pipeline: pipeline.to_string(),
                stages,
                current_stage: CurrentStage::NotStarted,
                overall_progress: 0.0,
                status: RunStatus::Idle,
                result: None,
                error: None,
                interrupted_stage: None,
                started_at: None,
                finished_at: None,
            },
            total_weight,
            outputs: Vec::new(),
        }
    }

    pub(crate) fn snapshot(&self) -> &PipelineRun {
        &self.run
    }

    pub(crate) fn stage_name(&self, index: usize) -> &str {
        self.run
            .stages
            .get(index)
            .map(|stage| stage.name.as_str())
            .unwrap_or_default()
    }

    /// idle -> running
    pub(crate) fn begin(&mut self) -> bool {
        if self.run.status != RunStatus::Idle {
            return false;
        }
        self.run.status = RunStatus::Running;
        self.run.started_at = Some(Utc::now());
        true
    }

    /// pending -> active, only for the stage right after the completed prefix.
    pub(crate) fn activate(&mut self, index: usize) -> bool {
        if self.run.status != RunStatus::Running {
            return false;
        }
        let prefix_done = self.run.stages[..index.min(self.run.stages.len())]
            .iter()
            .all(|stage| stage.state == StageState::Completed);
        match self.run.stages.get_mut(index) {
            Some(stage) if prefix_done && stage.state == StageState::Pending => {
                stage.state = StageState::Active;
                stage.progress = 0.0;
                self.run.current_stage = CurrentStage::At(index);
                true
            }
            _ => false,
        }
    }

    /// Record sub-progress for the active stage. Returns the new overall
    /// progress when the report was applied.
    pub(crate) fn report(&mut self, index: usize, progress: f64) -> Option<f64> {
        if !self.is_active(index) {
            return None;
        }
        self.run.stages[index].progress = progress.clamp(0.0, 100.0);
        Some(self.recompute())
    }

    /// active -> completed
    pub(crate) fn complete_stage(&mut self, index: usize, payload: Value) -> Option<f64> {
        if !self.is_active(index) {
            return None;
        }
        let stage = &mut self.run.stages[index];
        stage.state = StageState::Completed;
        stage.progress = 100.0;
        self.outputs.push(StageOutput {
            stage: stage.name.clone(),
            payload,
        });
        Some(self.recompute())
    }

    /// active -> failed, running -> failed
    pub(crate) fn fail_stage(&mut self, index: usize, cause: String) -> bool {
        if !self.is_active(index) {
            return false;
        }
        let stage = &mut self.run.stages[index];
        stage.state = StageState::Failed;
        self.run.error = Some(RunFailure {
            stage_name: stage.name.clone(),
            cause,
        });
        self.close(RunStatus::Failed);
        true
    }

    /// running -> cancelled. An interrupted active stage is marked failed.
    pub(crate) fn cancel(&mut self, interrupted: Option<usize>) -> bool {
        if self.run.status != RunStatus::Running {
            return false;
        }
        if let Some(index) = interrupted.filter(|&index| self.is_active(index)) {
            let stage = &mut self.run.stages[index];
            stage.state = StageState::Failed;
            self.run.interrupted_stage = Some(stage.name.clone());
        }
        self.close(RunStatus::Cancelled);
        true
    }

    /// running -> completed, once every stage has completed.
    pub(crate) fn finish(&mut self) -> Option<RunOutput> {
        let all_done = self
            .run
            .stages
            .iter()
            .all(|stage| stage.state == StageState::Completed);
        if self.run.status != RunStatus::Running || !all_done {
            return None;
        }
        let output = RunOutput {
            stages: std::mem::take(&mut self.outputs),
        };
        self.run.overall_progress = 100.0;
        self.run.current_stage = CurrentStage::PastEnd;
        self.run.result = Some(output.clone());
        self.close(RunStatus::Completed);
        Some(output)
    }

    fn is_active(&self, index: usize) -> bool {
        self.run.status == RunStatus::Running
            && self.run.current_stage == CurrentStage::At(index)
            && self
                .run
                .stages
                .get(index)
                .is_some_and(|stage| stage.state == StageState::Active)
    }

    fn close(&mut self, status: RunStatus) {
        self.run.status = status;
        self.run.finished_at = Some(Utc::now());
    }

    fn recompute(&mut self) -> f64 {
        let computed = if self
            .run
            .stages
            .iter()
            .all(|stage| stage.state == StageState::Completed)
        {
            100.0
        } else {
            weighted_progress(&self.run.stages, self.total_weight)
        };
        // Sub-stage reports may go backwards; the aggregate may not.
        self.run.overall_progress = computed.max(self.run.overall_progress).clamp(0.0, 100.0);
        self.run.overall_progress
    }
}

/// Completed stages count fully, the active stage by its own progress.
pub(crate) fn weighted_progress(stages: &[StageSnapshot], total_weight: f64) -> f64 {
    if total_weight <= 0.0 {
        return 0.0;
    }
    let done: f64 = stages
        .iter()
        .map(|stage| match stage.state {
            StageState::Completed => stage.weight,
            StageState::Active => stage.weight * stage.progress / 100.0,
            StageState::Pending | StageState::Failed => 0.0,
        })
        .sum();
    (done / total_weight * 100.0).clamp(0.0, 100.0)
}
