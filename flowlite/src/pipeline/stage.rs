//! Stage definition and execution hints.

use super::retry::{RetryPolicy, DEFAULT_TRANSIENT_TAGS};
use super::state::StepContext;
use super::task::{BoxedHandler, FnHandler, StageHandler};
use flowlite_shared::errors::{FlowliteError, FlowliteResult, StepFailure};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

// ============================================================================
// EXECUTION MODE
// ============================================================================

/// How a step runs its items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One item at a time, in order.
    Sequential,
    /// Up to `concurrency` items in flight.
    Parallel { concurrency: usize, ordered: bool },
}

impl ExecutionMode {
    pub fn is_parallel(&self) -> bool {
        matches!(self, Self::Parallel { .. })
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel {
                concurrency,
                ordered: true,
            } => write!(f, "parallel({concurrency})"),
            Self::Parallel {
                concurrency,
                ordered: false,
            } => write!(f, "parallel({concurrency}, unordered)"),
        }
    }
}

/// Execution hints passed when adding a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepOptions {
    pub parallel: bool,
    /// Falls back to the pipeline's `default_concurrency` when unset.
    pub concurrency: Option<usize>,
    /// Only meaningful for parallel steps.
    pub ordered: bool,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self::sequential()
    }
}

impl StepOptions {
    pub fn sequential() -> Self {
        Self {
            parallel: false,
            concurrency: None,
            ordered: true,
        }
    }

    pub fn parallel(concurrency: usize) -> Self {
        Self {
            parallel: true,
            concurrency: Some(concurrency),
            ordered: true,
        }
    }

    /// Emit results in completion order instead of input order.
    pub fn unordered(mut self) -> Self {
        self.ordered = false;
        self
    }

    pub(crate) fn validate(&self) -> FlowliteResult<()> {
        if self.concurrency == Some(0) {
            return Err(FlowliteError::InvalidArgument(
                "step concurrency must be a positive integer".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn resolve(&self, default_concurrency: usize) -> ExecutionMode {
        if !self.parallel {
            return ExecutionMode::Sequential;
        }
        ExecutionMode::Parallel {
            concurrency: self.concurrency.unwrap_or(default_concurrency),
            ordered: self.ordered,
        }
    }
}

// ============================================================================
// STAGE RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMetadata {
    pub step: String,
    pub attempt: u32,
    pub duration_ms: f64,
}

/// A classified stage error.
#[derive(Debug)]
pub struct StageFailure {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub cause: anyhow::Error,
}

impl StageFailure {
    /// Split into the structured step failure and the original error.
    pub(crate) fn into_step_failure(
        self,
        step: &str,
        attempts: u32,
    ) -> (StepFailure, anyhow::Error) {
        let failure = StepFailure {
            step: step.to_string(),
            code: self.code,
            message: self.message,
            retryable: self.retryable,
            attempts,
        };
        (failure, self.cause)
    }
}

/// Outcome of one stage invocation.
#[derive(Debug)]
pub enum StageResult<Out> {
    Success { data: Out, metadata: StageMetadata },
    Failure(StageFailure),
}

impl<Out> StageResult<Out> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

// ============================================================================
// TAGGED ERRORS
// ============================================================================

/// Error with an explicit code, for handlers that know what went wrong.
///
/// ```ignore
/// return Err(StageError::tagged("rate-limit", "429 from upstream").into());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StageError {
    pub tag: String,
    pub message: String,
}

impl StageError {
    pub fn tagged(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            message: message.into(),
        }
    }
}

const UNTAGGED_CODE: &str = "stage-error";

/// Derive an error code from the first recognisable error in the chain.
fn error_code(err: &anyhow::Error) -> String {
    for cause in err.chain() {
        if let Some(tagged) = cause.downcast_ref::<StageError>() {
            return tagged.tag.clone();
        }
        if cause.is::<tokio::time::error::Elapsed>() {
            return "timeout".into();
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionReset => return "connection-reset".into(),
                std::io::ErrorKind::ConnectionRefused => return "connection-refused".into(),
                std::io::ErrorKind::TimedOut => return "timeout".into(),
                _ => {}
            }
        }
    }
    UNTAGGED_CODE.into()
}

pub(crate) fn classify(err: anyhow::Error, extra_tags: &[String]) -> StageFailure {
    let code = error_code(&err);
    let message = format!("{err:#}");
    // Tags match the derived code only, never the message text.
    let retryable = DEFAULT_TRANSIENT_TAGS
        .iter()
        .copied()
        .chain(extra_tags.iter().map(String::as_str))
        .any(|tag| tag.eq_ignore_ascii_case(&code));

    StageFailure {
        code,
        message,
        retryable,
        cause: err,
    }
}

// ============================================================================
// STAGE
// ============================================================================

/// A named unit of work with an optional retry policy.
pub struct Stage<In, Out> {
    name: Arc<str>,
    handler: BoxedHandler<In, Out>,
    retry: Option<RetryPolicy>,
}

impl<In, Out> Clone for Stage<In, Out> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            handler: Arc::clone(&self.handler),
            retry: self.retry.clone(),
        }
    }
}

impl<In, Out> fmt::Debug for Stage<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl<In, Out> Stage<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub fn new<H>(name: impl Into<String>, handler: H) -> Self
    where
        H: StageHandler<In, Out> + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            handler: Arc::new(handler),
            retry: None,
        }
    }

    /// Stage backed by an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(In, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Out>> + Send + 'static,
    {
        Self::new(name, FnHandler::new(f))
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    /// Run the handler once and classify the outcome. Never retries.
    pub async fn execute(&self, input: In, ctx: &StepContext, attempt: u32) -> StageResult<Out> {
        let start = Instant::now();
        match self.handler.execute(input, ctx).await {
            Ok(data) => StageResult::Success {
                data,
                metadata: StageMetadata {
                    step: self.name.to_string(),
                    attempt,
                    duration_ms: start.elapsed().as_secs_f64() * 1000.0,
                },
            },
            Err(err) => {
                let tags: &[String] = self
                    .retry
                    .as_ref()
                    .map_or(&[], |policy| policy.retryable_tags.as_slice());
                StageResult::Failure(classify(err, tags))
            }
        }
    }
}
