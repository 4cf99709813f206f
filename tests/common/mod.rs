//! Shared test fixtures: remotely driven stages and progress capture.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use stagecraft::{Stage, StageAction, StageContext, StageError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

enum Command {
    Report(f64, oneshot::Sender<()>),
    Finish(Value),
    Fail(String),
}

/// Stage action that does nothing until told to by its [`Remote`].
struct Controlled {
    commands: tokio::sync::Mutex<mpsc::UnboundedReceiver<Command>>,
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl StageAction for Controlled {
    async fn run(&self, ctx: StageContext) -> Result<Value, StageError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let mut commands = self.commands.lock().await;
        while let Some(command) = commands.recv().await {
            match command {
                Command::Report(progress, ack) => {
                    ctx.report(progress);
                    let _ = ack.send(());
                }
                Command::Finish(payload) => return Ok(payload),
                Command::Fail(message) => {
                    return Err(StageError::permanent(anyhow::anyhow!(message)))
                }
            }
        }
        Err(StageError::permanent(anyhow::anyhow!("remote dropped")))
    }
}

/// Drives a [`Controlled`] stage from the test body.
#[derive(Clone)]
pub struct Remote {
    commands: mpsc::UnboundedSender<Command>,
    invocations: Arc<AtomicUsize>,
}

impl Remote {
    /// Report progress and wait until the stage has handed it to the engine.
    pub async fn report(&self, progress: f64) {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Report(progress, ack))
            .expect("stage action gone");
        done.await.expect("stage action dropped the report");
    }

    pub fn finish(&self, payload: Value) {
        let _ = self.commands.send(Command::Finish(payload));
    }

    pub fn fail(&self, message: &str) {
        let _ = self.commands.send(Command::Fail(message.to_string()));
    }

    /// How many times the action was invoked.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

/// A stage whose action is driven by the returned [`Remote`].
pub fn controlled(name: &str) -> (Stage, Remote) {
    let (tx, rx) = mpsc::unbounded_channel();
    let invocations = Arc::new(AtomicUsize::new(0));
    let stage = Stage::with_action(
        name,
        Controlled {
            commands: tokio::sync::Mutex::new(rx),
            invocations: invocations.clone(),
        },
    );
    (
        stage,
        Remote {
            commands: tx,
            invocations,
        },
    )
}

/// Stage that reports the given progress points and returns its name.
pub fn scripted(name: &str, points: &'static [f64]) -> Stage {
    Stage::from_fn(name, move |ctx: StageContext| async move {
        for point in points {
            ctx.report(*point);
            tokio::task::yield_now().await;
        }
        Ok(json!(ctx.stage_name()))
    })
}

/// Collects `on_progress` calls.
#[derive(Clone, Default)]
pub struct ProgressLog {
    calls: Arc<Mutex<Vec<(f64, String)>>>,
}

impl ProgressLog {
    pub fn callback(&self) -> impl Fn(f64, &str) + Send + Sync + 'static {
        let calls = self.calls.clone();
        move |overall, stage| calls.lock().unwrap().push((overall, stage.to_string()))
    }

    pub fn calls(&self) -> Vec<(f64, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn values(&self) -> Vec<f64> {
        self.calls().into_iter().map(|(overall, _)| overall).collect()
    }

    pub fn last(&self) -> Option<(f64, String)> {
        self.calls().last().cloned()
    }
}

pub fn assert_non_decreasing(values: &[f64]) {
    for pair in values.windows(2) {
        assert!(
            pair[1] >= pair[0],
            "overall progress went backwards: {} -> {} in {:?}",
            pair[0],
            pair[1],
            values
        );
    }
}
