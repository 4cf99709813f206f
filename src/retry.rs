//! Retry policy configuration and the retrying action wrapper.
//!
//! The engine never retries on its own. A stage that should survive transient
//! failures wraps its action in [`Retrying`].

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::stage::{StageAction, StageContext, StageError};

/// Policy for retrying failed actions.
#[derive(Debug, Clone, Default)]
pub enum RetryPolicy {
    /// No retries - fail immediately.
    #[default]
    None,

    /// Fixed delay between retries.
    Fixed {
        /// Maximum number of retry attempts.
        max_attempts: u32,
        /// Delay between attempts.
        delay: Duration,
    },

    /// Exponential backoff between retries.
    Exponential {
        /// Maximum number of retry attempts.
        max_attempts: u32,
        /// Initial delay (doubles each attempt).
        initial_delay: Duration,
        /// Maximum delay cap.
        max_delay: Duration,
    },
}

impl RetryPolicy {
    /// Create an exponential backoff policy with sensible defaults.
    ///
    /// - Initial delay: 1 second
    /// - Max delay: 5 minutes
    pub fn exponential(max_attempts: u32) -> Self {
        Self::Exponential {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }

    /// Create a fixed delay policy.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::Fixed { max_attempts, delay }
    }

    /// Calculate the delay for a given attempt number (1-indexed).
    ///
    /// Returns `None` if max attempts exceeded.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed { max_attempts, delay } => {
                if attempt <= *max_attempts {
                    Some(*delay)
                } else {
                    None
                }
            }
            Self::Exponential {
                max_attempts,
                initial_delay,
                max_delay,
            } => {
                if attempt <= *max_attempts {
                    // 2^(attempt-1) * initial_delay, capped at max_delay
                    let multiplier = 2u64.saturating_pow(attempt.saturating_sub(1));
                    let delay_ms = (initial_delay.as_millis() as u64).saturating_mul(multiplier);
                    let delay = Duration::from_millis(delay_ms.min(max_delay.as_millis() as u64));
                    Some(delay)
                } else {
                    None
                }
            }
        }
    }

    /// Returns the maximum number of retries allowed.
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fixed { max_attempts, .. } => *max_attempts,
            Self::Exponential { max_attempts, .. } => *max_attempts,
        }
    }
}

/// Action wrapper that re-runs `inner` on [`StageError::Retryable`].
///
/// Permanent errors pass through untouched. Waiting between attempts stops
/// early with [`StageError::Cancelled`] when the run is cancelled.
pub struct Retrying<A> {
    inner: A,
    policy: RetryPolicy,
}

impl<A: StageAction> Retrying<A> {
    pub fn new(inner: A, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<A: StageAction> StageAction for Retrying<A> {
    async fn run(&self, ctx: StageContext) -> Result<Value, StageError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.inner.run(ctx.clone()).await {
                Ok(payload) => return Ok(payload),
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };

            let Some(delay) = self.policy.delay_for_attempt(attempt) else {
                warn!(
                    stage = ctx.stage_name(),
                    attempts = attempt,
                    max_retries = self.policy.max_attempts(),
                    error = %err,
                    "Retries exhausted"
                );
                return Err(StageError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            };

            debug!(
                stage = ctx.stage_name(),
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying stage action"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancelled() => return Err(StageError::Cancelled),
            }
        }
    }
}
