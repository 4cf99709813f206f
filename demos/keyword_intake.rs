//! Keyword classifier example.
//!
//! ```bash
//! cargo run --example keyword_intake
//! ```
//!
//! Loads a custom rule table from JSON, classifies a handful of briefs
//! directly, then runs the classifier as the first stage of a pipeline.

use serde_json::json;
use stagecraft::{
    ClassifyAction, KeywordClassifier, Pipeline, RunOptions, Stage, StageContext, TextClassifier,
};
use std::sync::Arc;

const RULES: &str = r#"{
    "intents": [
        { "intent": "event", "keywords": ["wedding", "conference", "meetup", "rsvp"] },
        { "intent": "nonprofit", "keywords": ["charity", "donate", "volunteer", "cause"] }
    ],
    "requirements": [
        { "requirement": "donations", "keywords": ["donate", "donation", "fundraise"] },
        { "requirement": "rsvp_form", "keywords": ["rsvp", "guest list"] }
    ],
    "entities": [
        { "kind": "color", "values": ["gold", "navy", "green"] }
    ],
    "fallback_intent": "other"
}"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("=== Stagecraft - Keyword Intake Example ===\n");

    let classifier = Arc::new(KeywordClassifier::from_json(RULES)?);

    println!("--- Direct classification ---");
    for brief in [
        "Wedding page with an RSVP form and a guest list, navy and gold",
        "A charity site where people can donate and volunteer",
        "Something for my dog",
    ] {
        let result = classifier.classify(brief).await?;
        println!(
            "{:<11} {:.2} requirements={:?} entities={:?}",
            result.intent,
            result.confidence,
            result.requirements,
            result
                .entities
                .iter()
                .map(|entity| format!("{}={}", entity.kind, entity.value))
                .collect::<Vec<_>>()
        );
    }

    match classifier.classify("   ").await {
        Ok(_) => println!("Blank brief classified?"),
        Err(e) => println!("Blank brief rejected: {}", e),
    }

    println!("\n--- As a pipeline stage ---");
    let pipeline = Pipeline::new("intake")
        .stage(Stage::with_action(
            "Analyze",
            ClassifyAction::new(classifier, "Charity gala to fundraise for the animal shelter"),
        ))
        .stage(Stage::from_fn("Route", |ctx: StageContext| async move {
            ctx.report(100.0);
            Ok(json!({ "queue": "nonprofit-team" }))
        }))
        .build()?;

    let output = pipeline
        .start(RunOptions::new().on_progress(|overall, stage| {
            println!("{:>5.1}% {}", overall, stage);
        }))
        .wait()
        .await?;

    for stage in &output.stages {
        println!("{}: {}", stage.stage, stage.payload);
    }

    Ok(())
}
