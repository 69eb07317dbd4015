//! Error taxonomy for the flowlite engine.
//!
//! Construction errors (`InvalidArgument`, `DuplicateStep`, `Config`) are raised
//! while a sequence or pipeline is being assembled and never during execution.
//! Everything else is produced while a sequence is being driven.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type FlowliteResult<T> = Result<T, FlowliteError>;

#[derive(Debug, thiserror::Error)]
pub enum FlowliteError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("duplicate step name: {0}")]
    DuplicateStep(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// A stage failed after its retry policy was exhausted.
    ///
    /// `cause` is the error returned by the last attempt.
    #[error("{failure}")]
    Step {
        failure: StepFailure,
        #[source]
        cause: anyhow::Error,
    },

    /// A unit of work inside a parallel operator failed.
    ///
    /// `index` is the position of the failing item in the operator's input.
    #[error("item {index} failed: {source}")]
    Item {
        index: usize,
        #[source]
        source: Box<FlowliteError>,
    },

    #[error("source error: {0}")]
    Source(String),

    #[error("cleanup error: {0}")]
    Cleanup(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FlowliteError {
    /// Wrap an error raised by the item at `index` of a parallel operator.
    pub fn item(index: usize, source: FlowliteError) -> Self {
        Self::Item {
            index,
            source: Box::new(source),
        }
    }

    pub fn step(failure: StepFailure, cause: anyhow::Error) -> Self {
        Self::Step { failure, cause }
    }

    /// The structured step failure behind this error, if any.
    ///
    /// Looks through `Item` wrappers added by parallel operators.
    pub fn step_failure(&self) -> Option<&StepFailure> {
        match self {
            Self::Step { failure, .. } => Some(failure),
            Self::Item { source, .. } => source.step_failure(),
            _ => None,
        }
    }

    /// The error behind the final attempt of a failed step, for downcasting.
    pub fn step_cause(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Step { cause, .. } => Some(cause),
            Self::Item { source, .. } => source.step_cause(),
            _ => None,
        }
    }

    /// Input index of the innermost failing item, if a parallel operator was involved.
    pub fn failed_index(&self) -> Option<usize> {
        match self {
            Self::Item { index, source } => source.failed_index().or(Some(*index)),
            _ => None,
        }
    }

    /// Whether the error was raised while assembling a sequence or pipeline.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_) | Self::DuplicateStep(_) | Self::Config(_)
        )
    }
}

/// Final failure of a named pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step: String,
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub attempts: u32,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step '{}' failed after {} attempt(s) [{}{}]: {}",
            self.step,
            self.attempts,
            self.code,
            if self.retryable { ", retryable" } else { "" },
            self.message
        )
    }
}
