//! flowlite: a lazy, pull-based stream processing engine.
//!
//! Work moves through a chain of [`Sequence`] operators with bounded memory.
//! Parallel operators bound the number of in-flight invocations, and
//! cancellation reaches every upstream stage as soon as the consumer stops.
//! [`pipeline`] adds named steps, retries and per-step metrics on top.

pub mod compose;
pub mod logging;
pub mod metrics;
pub mod options;
pub mod parallel;
pub mod pipeline;
pub mod sequence;

pub use compose::{Transform, identity, lift, lift_async, lift_filter, lift_flat_map, pipe_all};
pub use flowlite_shared::errors::{FlowliteError, FlowliteResult, StepFailure};
pub use metrics::{MetricsCollector, wrap_with_metrics};
pub use options::{LoggingOptions, MetricsOptions, PipelineOptions};
pub use parallel::ParallelOptions;
pub use pipeline::{Pipeline, PipelineBuilder, RetryPolicy, Stage, StepContext, StepOptions};
pub use sequence::{PullSource, Sequence};
