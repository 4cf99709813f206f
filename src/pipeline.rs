//! Pipeline builder and run engine.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, warn};

use crate::recorder::{NoopRecorder, Recorder, RunConclusion, StageStatus};
use crate::signal::CancelSignal;
use crate::stage::{Stage, StageAction, StageContext, StageError};
use crate::state::{PipelineRun, RunId, RunOutput, RunState, RunStatus};

/// Callback receiving `(overall_progress, active_stage_name)`.
pub type ProgressCallback = Arc<dyn Fn(f64, &str) + Send + Sync>;

/// A stage list rejected before anything ran.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("pipeline has no stages")]
    NoStages,

    #[error("stage name must not be empty")]
    EmptyStageName,

    #[error("duplicate stage name '{0}'")]
    DuplicateStageName(String),

    #[error("stage '{0}' has no action")]
    MissingAction(String),

    #[error("stage '{stage}' has invalid weight {weight}")]
    InvalidWeight { stage: String, weight: f64 },

    #[error("stage weights sum to zero")]
    ZeroTotalWeight,
}

/// Why a run did not complete.
#[derive(Error, Debug)]
pub enum RunError {
    /// A stage's action returned an error.
    #[error("stage '{stage}' failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: StageError,
    },

    /// The run was cancelled. `stage` is the stage that was in flight.
    #[error("run cancelled{}", .stage.as_ref().map(|s| format!(" during stage '{}'", s)).unwrap_or_default())]
    Cancelled { stage: Option<String> },

    /// The driver task was lost before reaching a verdict.
    #[error("run aborted: {0}")]
    Aborted(String),
}

impl RunError {
    /// The terminal status this error corresponds to.
    pub fn status(&self) -> RunStatus {
        match self {
            Self::StageFailed { .. } | Self::Aborted(_) => RunStatus::Failed,
            Self::Cancelled { .. } => RunStatus::Cancelled,
        }
    }

    /// The failed or interrupted stage.
    pub fn stage_name(&self) -> Option<&str> {
        match self {
            Self::StageFailed { stage, .. } => Some(stage),
            Self::Cancelled { stage } => stage.as_deref(),
            Self::Aborted(_) => None,
        }
    }
}

/// Per-run options.
#[derive(Clone, Default)]
pub struct RunOptions {
    on_progress: Option<ProgressCallback>,
    signal: CancelSignal,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called synchronously on every progress update, in order.
    ///
    /// The callback runs while the run's state is locked: it must not report
    /// progress itself.
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(f64, &str) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    /// Use `signal` to cancel the run cooperatively.
    pub fn signal(mut self, signal: CancelSignal) -> Self {
        self.signal = signal;
        self
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("on_progress", &self.on_progress.is_some())
            .field("signal", &self.signal)
            .finish()
    }
}

/// Builder for constructing pipelines.
pub struct Pipeline {
    name: String,
    stages: Vec<Stage>,
    recorder: Arc<dyn Recorder>,
}

impl Pipeline {
    /// Create a new pipeline builder with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            recorder: Arc::new(NoopRecorder),
        }
    }

    /// Append a stage.
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Append several stages.
    pub fn stages(mut self, stages: impl IntoIterator<Item = Stage>) -> Self {
        self.stages.extend(stages);
        self
    }

    /// Set the recorder for this pipeline.
    pub fn with_recorder<R: Recorder + 'static>(mut self, recorder: R) -> Self {
        self.recorder = Arc::new(recorder);
        self
    }

    /// Validate the stage list and freeze the pipeline.
    pub fn build(self) -> Result<BuiltPipeline, ConfigurationError> {
        let actions = validate(&self.stages)?;
        Ok(BuiltPipeline {
            name: Arc::from(self.name),
            stages: Arc::from(self.stages),
            actions: Arc::from(actions),
            recorder: self.recorder,
        })
    }
}

/// Checks the stage list and returns each stage's action, in order.
fn validate(stages: &[Stage]) -> Result<Vec<Arc<dyn StageAction>>, ConfigurationError> {
    if stages.is_empty() {
        return Err(ConfigurationError::NoStages);
    }

    let mut seen = HashSet::new();
    let mut actions = Vec::with_capacity(stages.len());
    let mut total_weight = 0.0;

    for stage in stages {
        let name = stage.name();
        if name.trim().is_empty() {
            return Err(ConfigurationError::EmptyStageName);
        }
        if !seen.insert(name) {
            return Err(ConfigurationError::DuplicateStageName(name.to_string()));
        }
        let weight = stage.effective_weight();
        if !weight.is_finite() || weight < 0.0 {
            return Err(ConfigurationError::InvalidWeight {
                stage: name.to_string(),
                weight,
            });
        }
        total_weight += weight;

        let action = stage
            .action_ref()
            .ok_or_else(|| ConfigurationError::MissingAction(name.to_string()))?;
        actions.push(action.clone());
    }

    if total_weight <= 0.0 {
        return Err(ConfigurationError::ZeroTotalWeight);
    }
    Ok(actions)
}

/// Validate `stages` and start a run over them.
///
/// Must be called from within a tokio runtime.
pub fn start(stages: Vec<Stage>, options: RunOptions) -> Result<RunHandle, ConfigurationError> {
    Ok(Pipeline::new("pipeline").stages(stages).build()?.start(options))
}

/// A validated pipeline. Each call to [`BuiltPipeline::start`] creates an
/// independent run.
#[derive(Clone)]
pub struct BuiltPipeline {
    name: Arc<str>,
    stages: Arc<[Stage]>,
    actions: Arc<[Arc<dyn StageAction>]>,
    recorder: Arc<dyn Recorder>,
}

impl BuiltPipeline {
    /// Get the pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Start a new run and return its handle.
    ///
    /// The run is driven on a spawned task, so this must be called from
    /// within a tokio runtime.
    pub fn start(&self, options: RunOptions) -> RunHandle {
        let id = RunId::new();
        let state = RunState::new(id, &self.name, &self.stages);
        let (snapshots, receiver) = watch::channel(state.snapshot().clone());

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            snapshots,
            on_progress: options.on_progress,
        });

        let driver = Driver {
            id,
            pipeline: self.name.clone(),
            actions: self.actions.clone(),
            recorder: self.recorder.clone(),
            signal: options.signal.clone(),
            shared,
        };

        RunHandle {
            id,
            pipeline: self.name.clone(),
            snapshots: receiver,
            signal: options.signal,
            driver: tokio::spawn(driver.drive()),
        }
    }
}

impl fmt::Debug for BuiltPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltPipeline")
            .field("name", &self.name)
            .field("stages", &self.stages)
            .finish()
    }
}

/// Handle to a live run.
pub struct RunHandle {
    id: RunId,
    pipeline: Arc<str>,
    snapshots: watch::Receiver<PipelineRun>,
    signal: CancelSignal,
    driver: JoinHandle<Result<RunOutput, RunError>>,
}

impl RunHandle {
    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Current state of the run.
    pub fn snapshot(&self) -> PipelineRun {
        self.snapshots.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<PipelineRun> {
        self.snapshots.clone()
    }

    /// Ask the run to stop. In-flight actions are not aborted.
    pub fn cancel(&self) {
        self.signal.cancel();
    }

    /// The run's cancellation signal.
    pub fn signal(&self) -> &CancelSignal {
        &self.signal
    }

    /// Returns true once the run has reached a verdict.
    pub fn is_finished(&self) -> bool {
        self.driver.is_finished()
    }

    /// Wait for the run's outcome.
    pub async fn wait(self) -> Result<RunOutput, RunError> {
        match self.driver.await {
            Ok(outcome) => outcome,
            Err(e) => Err(RunError::Aborted(e.to_string())),
        }
    }
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle")
            .field("id", &self.id)
            .field("pipeline", &self.pipeline)
            .field("status", &self.snapshots.borrow().status)
            .finish()
    }
}

/// State shared between the driver and the progress reporters of its actions.
struct Shared {
    state: Mutex<RunState>,
    snapshots: watch::Sender<PipelineRun>,
    on_progress: Option<ProgressCallback>,
}

impl Shared {
    fn read<T>(&self, f: impl FnOnce(&RunState) -> T) -> T {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    /// Apply a transition and publish the resulting snapshot.
    fn apply<T>(&self, f: impl FnOnce(&mut RunState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let out = f(&mut state);
        self.snapshots.send_replace(state.snapshot().clone());
        out
    }

    /// Apply a progress-producing transition, publish, then notify the callback.
    ///
    /// The callback runs under the lock so callers see updates in order.
    fn apply_progress(&self, index: usize, f: impl FnOnce(&mut RunState) -> Option<f64>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(overall) = f(&mut state) else {
            return;
        };
        self.snapshots.send_replace(state.snapshot().clone());
        if let Some(callback) = &self.on_progress {
            let stage = state.stage_name(index);
            // Observer panics never reach the driver or the action.
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(overall, stage))) {
                error!(
                    run_id = %state.snapshot().id,
                    stage,
                    overall,
                    panic = %panic_message(payload),
                    "Progress callback panicked"
                );
            }
        }
    }
}

/// Drives one run from idle to a terminal status.
struct Driver {
    id: RunId,
    pipeline: Arc<str>,
    actions: Arc<[Arc<dyn StageAction>]>,
    recorder: Arc<dyn Recorder>,
    signal: CancelSignal,
    shared: Arc<Shared>,
}

impl Driver {
    async fn drive(self) -> Result<RunOutput, RunError> {
        self.shared.apply(|state| state.begin());
        debug!(
            run_id = %self.id,
            pipeline = %self.pipeline,
            stages = self.actions.len(),
            "Run started"
        );
        log_recorder_error(
            self.recorder
                .start_run(self.id, &self.pipeline, self.actions.len())
                .await,
        );

        for (index, action) in self.actions.iter().enumerate() {
            if self.signal.is_cancelled() {
                return self.cancelled(None).await;
            }

            let stage_name: Arc<str> = Arc::from(self.stage_name(index));
            self.shared.apply_progress(index, |state| {
                state.activate(index).then(|| state.snapshot().overall_progress)
            });
            debug!(run_id = %self.id, stage = %stage_name, index, "Stage activated");
            log_recorder_error(self.recorder.start_stage(self.id, &stage_name, index).await);

            let reporter = {
                let shared = self.shared.clone();
                move |progress: f64| {
                    shared.apply_progress(index, |state| state.report(index, progress));
                }
            };
            let ctx = StageContext::new(
                self.id,
                stage_name.clone(),
                index,
                Arc::new(reporter),
                self.signal.clone(),
            );

            let action = action.clone();
            let mut task = tokio::spawn(async move { action.run(ctx).await });

            // A finished action wins over a simultaneous cancellation.
            let joined = tokio::select! {
                biased;
                joined = &mut task => joined,
                _ = self.signal.cancelled() => {
                    warn!(
                        run_id = %self.id,
                        stage = %stage_name,
                        "Cancelled while stage in flight; leaving action detached"
                    );
                    drop(task);
                    return self.cancelled(Some(index)).await;
                }
            };

            match joined.map_err(panic_to_stage_error).and_then(|outcome| outcome) {
                Ok(payload) => {
                    self.shared
                        .apply_progress(index, |state| state.complete_stage(index, payload));
                    debug!(run_id = %self.id, stage = %stage_name, "Stage completed");
                    log_recorder_error(
                        self.recorder
                            .complete_stage(self.id, index, StageStatus::Completed)
                            .await,
                    );
                }
                // An action that stopped because of the signal ends the run as cancelled.
                Err(StageError::Cancelled) if self.signal.is_cancelled() => {
                    return self.cancelled(Some(index)).await;
                }
                Err(source) => return self.failed(index, &stage_name, source).await,
            }
        }

        match self.shared.apply(|state| state.finish()) {
            Some(output) => {
                debug!(run_id = %self.id, pipeline = %self.pipeline, "Run completed");
                log_recorder_error(
                    self.recorder
                        .complete_run(self.id, RunConclusion::Completed)
                        .await,
                );
                Ok(output)
            }
            // Only reachable if the state machine rejected a transition above.
            None => Err(RunError::Aborted(format!(
                "run {} ended in unexpected state {}",
                self.id,
                self.shared.read(|state| state.snapshot().status)
            ))),
        }
    }

    fn stage_name(&self, index: usize) -> String {
        self.shared.read(|state| state.stage_name(index).to_string())
    }

    async fn failed(
        &self,
        index: usize,
        stage_name: &str,
        source: StageError,
    ) -> Result<RunOutput, RunError> {
        let cause = source.to_string();
        self.shared
            .apply(|state| state.fail_stage(index, cause.clone()));
        debug!(
            run_id = %self.id,
            pipeline = %self.pipeline,
            stage = stage_name,
            error = %cause,
            "Stage failed"
        );
        log_recorder_error(
            self.recorder
                .complete_stage(
                    self.id,
                    index,
                    StageStatus::Failed {
                        error: cause.clone(),
                    },
                )
                .await,
        );
        log_recorder_error(
            self.recorder
                .complete_run(
                    self.id,
                    RunConclusion::Failed {
                        stage: stage_name.to_string(),
                        error: cause,
                    },
                )
                .await,
        );
        Err(RunError::StageFailed {
            stage: stage_name.to_string(),
            source,
        })
    }

    async fn cancelled(&self, interrupted: Option<usize>) -> Result<RunOutput, RunError> {
        self.shared.apply(|state| state.cancel(interrupted));
        let stage = interrupted.map(|index| self.stage_name(index));
        debug!(
            run_id = %self.id,
            pipeline = %self.pipeline,
            stage = ?stage,
            "Run cancelled"
        );
        if let Some(index) = interrupted {
            log_recorder_error(
                self.recorder
                    .complete_stage(self.id, index, StageStatus::Cancelled)
                    .await,
            );
        }
        log_recorder_error(
            self.recorder
                .complete_run(
                    self.id,
                    RunConclusion::Cancelled {
                        stage: stage.clone(),
                    },
                )
                .await,
        );
        Err(RunError::Cancelled { stage })
    }
}

fn log_recorder_error(result: anyhow::Result<()>) {
    if let Err(e) = result {
        warn!(error = %e, "Recorder error");
    }
}

fn panic_to_stage_error(err: JoinError) -> StageError {
    if err.is_panic() {
        StageError::Panicked(panic_message(err.into_panic()))
    } else {
        StageError::Panicked(err.to_string())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
