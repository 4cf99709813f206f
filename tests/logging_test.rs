//! Log output of a run: the engine logs lifecycle at `debug`, and the
//! `TracingRecorder` is the only source of `info`-level lifecycle events.

mod common;

use std::fmt;
use std::sync::{Arc, Mutex};

use stagecraft::{Pipeline, RunOptions, TracingRecorder};
use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use common::{controlled, scripted};

type Captured = Arc<Mutex<Vec<(Level, String)>>>;

/// Layer that keeps the level and message of every event.
struct Capture(Captured);

impl<S: Subscriber> Layer<S> for Capture {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut message = MessageVisitor::default();
        event.record(&mut message);
        self.0
            .lock()
            .unwrap()
            .push((*event.metadata().level(), message.0));
    }
}

#[derive(Default)]
struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

fn count(events: &Captured, level: Level, message: &str) -> usize {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|(l, m)| *l == level && m == message)
        .count()
}

#[tokio::test]
async fn test_lifecycle_is_logged_once_at_info() {
    let events: Captured = Arc::default();
    let _guard =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(Capture(events.clone())));

    Pipeline::new("logged")
        .stage(scripted("Analyze", &[50.0]))
        .stage(scripted("Deploy", &[]))
        .with_recorder(TracingRecorder)
        .build()
        .unwrap()
        .start(RunOptions::new())
        .wait()
        .await
        .unwrap();

    assert_eq!(count(&events, Level::INFO, "Run started"), 1);
    assert_eq!(count(&events, Level::INFO, "Run completed"), 1);
    assert_eq!(count(&events, Level::DEBUG, "Run started"), 1);
    assert_eq!(count(&events, Level::DEBUG, "Run completed"), 1);
    assert_eq!(count(&events, Level::INFO, "Stage completed"), 2);
}

#[tokio::test]
async fn test_failure_is_logged_once_at_error() {
    let events: Captured = Arc::default();
    let _guard =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(Capture(events.clone())));

    let (analyze, analyze_remote) = controlled("Analyze");
    let handle = Pipeline::new("logged_failure")
        .stage(analyze)
        .with_recorder(TracingRecorder)
        .build()
        .unwrap()
        .start(RunOptions::new());
    analyze_remote.fail("brief unreadable");
    handle.wait().await.unwrap_err();

    assert_eq!(count(&events, Level::ERROR, "Stage failed"), 1);
    assert_eq!(count(&events, Level::ERROR, "Run failed"), 1);
}
