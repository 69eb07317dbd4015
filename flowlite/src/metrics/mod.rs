//! Observability for sequences.
//!
//! ```text
//!   source ──▶ wrap_with_metrics ──▶ consumer
//!                     │
//!                     ▼
//!             MetricsCollector ──▶ snapshot() ──▶ StreamMetadata
//!              ├─ counters (atomics)
//!              ├─ in-flight ItemMetrics
//!              ├─ raw sample ring (exact percentiles)
//!              └─ CentroidDigest  (bounded estimate)
//! ```
//!
//! A collector is owned by one sequence. Snapshots can be taken at any time
//! from any clone of the handle, including while the sequence is running.

mod collector;
pub mod digest;
mod snapshot;
mod wrap;

pub use collector::{ItemMetrics, MetricsCollector};
pub use digest::{Centroid, CentroidDigest};
pub use snapshot::{LatencyStats, StreamMetadata, StreamOperationMetadata};
pub use wrap::wrap_with_metrics;
