//! Per-stage time budget.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::stage::{StageAction, StageContext, StageError};

/// Action wrapper that fails with [`StageError::Timeout`] when `inner` takes
/// longer than `limit`.
pub struct WithTimeout<A> {
    inner: A,
    limit: Duration,
}

impl<A: StageAction> WithTimeout<A> {
    pub fn new(inner: A, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl<A: StageAction> StageAction for WithTimeout<A> {
    async fn run(&self, ctx: StageContext) -> Result<Value, StageError> {
        tokio::time::timeout(self.limit, self.inner.run(ctx))
            .await
            .map_err(|_| StageError::Timeout(self.limit))?
    }
}
