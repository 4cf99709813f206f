//! Text classification collaborator.
//!
//! [`TextClassifier`] turns a free-form request ("build me a bakery shop with
//! online ordering") into an intent, entities and requirement list.
//! [`KeywordClassifier`] is a rule-table implementation; [`ClassifyAction`]
//! runs any classifier as a stage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::stage::{StageAction, StageContext, StageError};

/// Error returned by a classifier.
#[derive(Error, Debug)]
pub enum ClassificationError {
    #[error("nothing to classify")]
    EmptyInput,

    #[error("classifier did not answer within {0:?}")]
    Timeout(Duration),

    #[error("classifier backend failed: {0}")]
    Backend(#[source] anyhow::Error),
}

/// Something named in the text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: String,
    pub value: String,
}

/// Result of classifying a piece of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: String,
    pub entities: Vec<Entity>,
    pub requirements: Vec<String>,
    /// In `[0, 1]`.
    pub confidence: f64,
}

/// Classifies free-form text.
#[async_trait]
pub trait TextClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification, ClassificationError>;
}

/// One intent and the keywords that signal it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentRule {
    pub intent: String,
    pub keywords: Vec<String>,
}

/// A requirement and the keywords that imply it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementRule {
    pub requirement: String,
    pub keywords: Vec<String>,
}

/// An entity kind and the literal values recognised for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRule {
    pub kind: String,
    pub values: Vec<String>,
}

/// Rule table for [`KeywordClassifier`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordRules {
    pub intents: Vec<IntentRule>,
    #[serde(default)]
    pub requirements: Vec<RequirementRule>,
    #[serde(default)]
    pub entities: Vec<EntityRule>,
    /// Intent reported when no intent keyword matches.
    #[serde(default = "default_fallback_intent")]
    pub fallback_intent: String,
    /// Confidence reported with the fallback intent.
    #[serde(default = "default_fallback_confidence")]
    pub fallback_confidence: f64,
}

fn default_fallback_intent() -> String {
    "general".to_string()
}

fn default_fallback_confidence() -> f64 {
    0.3
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn intent(name: &str, keywords: &[&str]) -> IntentRule {
    IntentRule {
        intent: name.to_string(),
        keywords: words(keywords),
    }
}

fn requirement(name: &str, keywords: &[&str]) -> RequirementRule {
    RequirementRule {
        requirement: name.to_string(),
        keywords: words(keywords),
    }
}

impl Default for KeywordRules {
    /// Rules for website-builder requests.
    fn default() -> Self {
        Self {
            intents: vec![
                intent("ecommerce", &["shop", "store", "sell", "product", "cart", "checkout"]),
                intent("portfolio", &["portfolio", "showcase", "my work", "resume", "photographer"]),
                intent("blog", &["blog", "articles", "posts", "writing", "journal"]),
                intent("restaurant", &["restaurant", "menu", "cafe", "bakery", "reservation"]),
                intent("landing_page", &["landing", "launch", "waitlist", "startup", "signup"]),
                intent("saas", &["saas", "dashboard", "subscription", "pricing", "app"]),
            ],
            requirements: vec![
                requirement("payments", &["payment", "checkout", "stripe", "pay online", "ordering"]),
                requirement("contact_form", &["contact", "get in touch", "enquiry", "inquiry"]),
                requirement("booking", &["booking", "reservation", "appointment", "schedule"]),
                requirement("gallery", &["gallery", "photos", "images", "showcase"]),
                requirement("newsletter", &["newsletter", "mailing list", "subscribe"]),
                requirement("authentication", &["login", "sign in", "account", "members"]),
                requirement("seo", &["seo", "search engine", "google ranking"]),
            ],
            entities: vec![
                EntityRule {
                    kind: "color".to_string(),
                    values: words(&[
                        "red", "blue", "green", "black", "white", "purple", "orange", "yellow",
                        "pink", "teal",
                    ]),
                },
                EntityRule {
                    kind: "page".to_string(),
                    values: words(&["home", "about", "pricing", "faq", "team", "careers"]),
                },
            ],
            fallback_intent: default_fallback_intent(),
            fallback_confidence: default_fallback_confidence(),
        }
    }
}

/// Case-insensitive substring matcher over a [`KeywordRules`] table.
///
/// The intent with the most matching keywords wins (earlier rules break
/// ties). Confidence is the share of that rule's keywords found, floored at
/// the fallback confidence.
#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier {
    rules: KeywordRules,
}

impl KeywordClassifier {
    pub fn new(rules: KeywordRules) -> Self {
        Self { rules }
    }

    /// Load rules from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub fn rules(&self) -> &KeywordRules {
        &self.rules
    }

    /// Synchronous classification used by the async trait method.
    pub fn classify_text(&self, text: &str) -> Result<Classification, ClassificationError> {
        let text = text.trim().to_lowercase();
        if text.is_empty() {
            return Err(ClassificationError::EmptyInput);
        }

        let best = self
            .rules
            .intents
            .iter()
            .map(|rule| (rule, count_matches(&text, &rule.keywords)))
            .filter(|(_, hits)| *hits > 0)
            .fold(None::<(&IntentRule, usize)>, |best, candidate| match best {
                Some((_, best_hits)) if best_hits >= candidate.1 => best,
                _ => Some(candidate),
            });

        let fallback_confidence = unit_interval(self.rules.fallback_confidence);
        let (intent, confidence) = match best {
            Some((rule, hits)) => {
                let share = hits as f64 / rule.keywords.len().max(1) as f64;
                (
                    rule.intent.clone(),
                    unit_interval(share.max(fallback_confidence)),
                )
            }
            None => (self.rules.fallback_intent.clone(), fallback_confidence),
        };

        let requirements = self
            .rules
            .requirements
            .iter()
            .filter(|rule| count_matches(&text, &rule.keywords) > 0)
            .map(|rule| rule.requirement.clone())
            .collect();

        let entities = self
            .rules
            .entities
            .iter()
            .flat_map(|rule| {
                rule.values
                    .iter()
                    .filter(|value| contains_word(&text, value))
                    .map(|value| Entity {
                        kind: rule.kind.clone(),
                        value: value.clone(),
                    })
            })
            .collect();

        Ok(Classification {
            intent,
            entities,
            requirements,
            confidence,
        })
    }
}

#[async_trait]
impl TextClassifier for KeywordClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, ClassificationError> {
        self.classify_text(text)
    }
}

/// Clamps to `[0, 1]`; non-finite values count as no confidence.
fn unit_interval(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn count_matches(text: &str, keywords: &[String]) -> usize {
    keywords
        .iter()
        .filter(|keyword| text.contains(keyword.to_lowercase().as_str()))
        .count()
}

/// Whole-word match, so "red" does not fire on "ordered".
fn contains_word(text: &str, word: &str) -> bool {
    let word = word.to_lowercase();
    text.split(|c: char| !c.is_alphanumeric())
        .any(|token| token == word)
}

/// Stage action that classifies a fixed piece of text.
///
/// The stage payload is the serialized [`Classification`].
pub struct ClassifyAction {
    classifier: Arc<dyn TextClassifier>,
    text: String,
    timeout: Option<Duration>,
}

impl ClassifyAction {
    pub fn new(classifier: Arc<dyn TextClassifier>, text: impl Into<String>) -> Self {
        Self {
            classifier,
            text: text.into(),
            timeout: None,
        }
    }

    /// Fail with [`ClassificationError::Timeout`] if the classifier takes
    /// longer than `limit`.
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }
}

#[async_trait]
impl StageAction for ClassifyAction {
    async fn run(&self, ctx: StageContext) -> Result<Value, StageError> {
        ctx.report(0.0);
        let classification = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.classifier.classify(&self.text))
                .await
                .map_err(|_| ClassificationError::Timeout(limit))??,
            None => self.classifier.classify(&self.text).await?,
        };
        ctx.report(100.0);
        serde_json::to_value(&classification).map_err(StageError::permanent)
    }
}
