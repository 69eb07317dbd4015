//! Retry policy for stages.

use super::stage::{Stage, StageResult};
use super::state::StepContext;
use flowlite_shared::errors::{FlowliteError, FlowliteResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Error tags treated as transient for every stage.
pub const DEFAULT_TRANSIENT_TAGS: [&str; 3] = ["connection-reset", "timeout", "connection-refused"];

/// How often, and how patiently, a failing stage is re-invoked.
///
/// Only failures classified as retryable are retried. The delay before
/// attempt `n + 1` is `backoff_ms × n`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub backoff_ms: u64,
    /// Extra tags, on top of [`DEFAULT_TRANSIENT_TAGS`], that mark an error as retryable.
    pub retryable_tags: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 100,
            retryable_tags: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_ms,
            retryable_tags: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.retryable_tags.push(tag.into());
        self
    }

    /// Delay after the failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn validate(&self) -> FlowliteResult<()> {
        if self.max_attempts == 0 {
            return Err(FlowliteError::InvalidArgument(
                "retry policy max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Run `stage`, re-invoking retryable failures as its policy allows.
///
/// The final failure becomes [`FlowliteError::Step`] carrying the attempt count.
pub(crate) async fn execute_with_retry<In, Out>(
    stage: &Stage<In, Out>,
    input: In,
    ctx: &StepContext,
) -> FlowliteResult<Out>
where
    In: Clone + Send + 'static,
    Out: Send + 'static,
{
    let policy = stage.retry_policy();
    let max_attempts = policy.map_or(1, |p| p.max_attempts.max(1));
    let mut attempt = 1;

    loop {
        let failure = match stage.execute(input.clone(), ctx, attempt).await {
            StageResult::Success { data, .. } => return Ok(data),
            StageResult::Failure(failure) => failure,
        };

        let Some(policy) = policy.filter(|_| failure.retryable && attempt < max_attempts) else {
            tracing::debug!(
                step = stage.name(),
                attempt,
                code = %failure.code,
                retryable = failure.retryable,
                cause = ?failure.cause,
                "Step failed"
            );
            let (step_failure, cause) = failure.into_step_failure(stage.name(), attempt);
            return Err(FlowliteError::step(step_failure, cause));
        };

        let delay = policy.delay_after(attempt);
        tracing::debug!(
            step = stage.name(),
            attempt,
            code = %failure.code,
            delay_ms = delay.as_millis() as u64,
            "Retrying step"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
