//! Named-step pipelines over sequences.
//!
//! ## Architecture
//!
//! ```text
//! PipelineBuilder → Pipeline → PipelineRun
//!
//! - PipelineBuilder: records named steps and their execution hints
//! - Pipeline: validated, reusable chain of steps
//! - PipelineRun: one lazy execution with its own id and metrics
//! ```
//!
//! Items travel as [`Envelope`]s: the value plus a [`PipelineState`] holding
//! the output of every step the item has passed through. A step reads earlier
//! outputs through its [`StepContext`]; its own output is recorded after it
//! finishes.
//!
//! Work inside a step is a [`Stage`]: a named [`StageHandler`] with an
//! optional [`RetryPolicy`]. A stage classifies its errors; the pipeline
//! decides whether to retry.
//!
//! ## Example
//!
//! ```ignore
//! use flowlite::pipeline::{PipelineBuilder, StepOptions};
//! use flowlite::Sequence;
//!
//! let pipeline = PipelineBuilder::<String, String>::new()
//!     .map_step("trim", |s: String, _ctx| async move { Ok(s.trim().to_string()) }, StepOptions::default())
//!     .filter_step("non_empty", |s: String, _ctx| async move { Ok(!s.is_empty()) }, StepOptions::default())
//!     .map_step("embed", embed, StepOptions::parallel(8))
//!     .batch_step("batch", 32)
//!     .build()?;
//!
//! let batches = pipeline.execute_to_array(Sequence::from_items(lines)).await?;
//! ```

mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod retry;
mod stage;
mod state;
mod task;

pub use metrics::{PipelineMetrics, RunMonitor};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineRun};
pub use retry::{DEFAULT_TRANSIENT_TAGS, RetryPolicy};
pub use stage::{
    ExecutionMode, Stage, StageError, StageFailure, StageMetadata, StageResult, StepOptions,
};
pub use state::{Envelope, PipelineState, Resources, StepContext};
pub use task::{BoxedHandler, StageHandler};
