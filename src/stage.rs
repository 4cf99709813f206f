//! Stage definitions, the stage action trait and error types.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::classifier::ClassificationError;
use crate::signal::CancelSignal;
use crate::state::RunId;

/// Error returned by a stage action.
#[derive(Error, Debug)]
pub enum StageError {
    /// Transient failure - a `Retrying` wrapper may run the action again.
    #[error("retryable: {0}")]
    Retryable(#[source] anyhow::Error),

    /// Permanent failure - won't succeed on retry.
    #[error("permanent: {0}")]
    Permanent(#[source] anyhow::Error),

    /// The text classifier backing this stage failed.
    #[error("classification failed: {0}")]
    Classification(#[from] ClassificationError),

    /// The action did not finish within its time budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A retry wrapper gave up.
    #[error("exhausted {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<StageError>,
    },

    /// The action observed the cancellation signal and stopped.
    #[error("cancelled")]
    Cancelled,

    /// The action panicked.
    #[error("panicked: {0}")]
    Panicked(String),
}

impl StageError {
    /// Create a retryable error.
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(err.into())
    }

    /// Create a permanent error.
    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

type Reporter = Arc<dyn Fn(f64) + Send + Sync>;

/// Handle given to a running stage action.
///
/// Carries the progress reporter and the run's cancellation signal. Cheap to
/// clone; wrappers such as [`crate::Retrying`] hand a clone to each attempt.
#[derive(Clone)]
pub struct StageContext {
    run_id: RunId,
    stage_name: Arc<str>,
    stage_index: usize,
    reporter: Reporter,
    signal: CancelSignal,
}

impl StageContext {
    pub(crate) fn new(
        run_id: RunId,
        stage_name: Arc<str>,
        stage_index: usize,
        reporter: Reporter,
        signal: CancelSignal,
    ) -> Self {
        Self {
            run_id,
            stage_name,
            stage_index,
            reporter,
            signal,
        }
    }

    /// Build a context outside of a run, e.g. to exercise an action directly.
    ///
    /// Progress reports go to `reporter`.
    pub fn standalone<F>(stage_name: &str, signal: CancelSignal, reporter: F) -> Self
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        Self::new(RunId::new(), Arc::from(stage_name), 0, Arc::new(reporter), signal)
    }

    /// The run this stage belongs to.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Name of the stage being executed.
    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Position of the stage in its pipeline.
    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    /// Report the stage's own progress, in percent.
    ///
    /// Values are clamped to `[0, 100]`; NaN is ignored. Reports made after
    /// the stage stopped being active (cancelled run, detached action) have
    /// no effect.
    pub fn report(&self, progress: f64) {
        if progress.is_nan() {
            return;
        }
        (self.reporter)(progress.clamp(0.0, 100.0));
    }

    /// Returns true once the run has been asked to cancel.
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Resolves when the run is asked to cancel.
    pub async fn cancelled(&self) {
        self.signal.cancelled().await
    }

    /// The run's cancellation signal.
    pub fn signal(&self) -> &CancelSignal {
        &self.signal
    }
}

impl fmt::Debug for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("run_id", &self.run_id)
            .field("stage_name", &self.stage_name)
            .field("stage_index", &self.stage_index)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// The asynchronous work performed by a stage.
#[async_trait]
pub trait StageAction: Send + Sync {
    /// Run the stage, reporting progress through `ctx`, and return its payload.
    async fn run(&self, ctx: StageContext) -> Result<Value, StageError>;
}

/// Adapter turning an async closure into a [`StageAction`].
pub struct FnAction<F>(F);

impl<F, Fut> FnAction<F>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StageError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> StageAction for FnAction<F>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StageError>> + Send,
{
    async fn run(&self, ctx: StageContext) -> Result<Value, StageError> {
        (self.0)(ctx).await
    }
}

/// A named unit of work in a pipeline.
#[derive(Clone)]
pub struct Stage {
    name: String,
    description: String,
    weight: Option<f64>,
    action: Option<Arc<dyn StageAction>>,
}

impl Stage {
    /// Create a stage without an action. One must be attached before the
    /// stage can be part of a run.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            weight: None,
            action: None,
        }
    }

    /// Create a stage backed by `action`.
    pub fn with_action<A: StageAction + 'static>(name: impl Into<String>, action: A) -> Self {
        Self::new(name).action(action)
    }

    /// Create a stage backed by an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StageError>> + Send + 'static,
    {
        Self::with_action(name, FnAction::new(f))
    }

    /// Attach (or replace) the stage's action.
    pub fn action<A: StageAction + 'static>(mut self, action: A) -> Self {
        self.action = Some(Arc::new(action));
        self
    }

    /// Attach an already shared action.
    pub fn shared_action(mut self, action: Arc<dyn StageAction>) -> Self {
        self.action = Some(action);
        self
    }

    /// Set the display description.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the relative weight used for overall progress. Defaults to 1.
    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    /// The stage name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The display description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The effective weight.
    pub fn effective_weight(&self) -> f64 {
        self.weight.unwrap_or(1.0)
    }

    pub(crate) fn action_ref(&self) -> Option<&Arc<dyn StageAction>> {
        self.action.as_ref()
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("weight", &self.weight)
            .field("has_action", &self.action.is_some())
            .finish()
    }
}
