//! Plain snapshot records handed to external logging and telemetry sinks.

use crate::pipeline::ExecutionMode;
use serde::{Deserialize, Serialize};

/// Latency statistics in milliseconds. All zero until an item completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Aggregate view of one observed sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Items pulled so far (including the one in flight, if any).
    pub total_items: u64,
    pub successful_items: u64,
    pub failed_items: u64,
    pub skipped_items: u64,
    /// Items pulled but not yet produced.
    pub in_flight: usize,
    pub time_to_first_item_ms: Option<f64>,
    pub elapsed_ms: f64,
    /// Completed items per second of wall time since the collector was created.
    pub throughput_per_sec: f64,
    pub completed: bool,
    pub latency: LatencyStats,
}

/// Metrics for a single named operation inside a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamOperationMetadata {
    pub index: usize,
    pub operation: String,
    pub execution: ExecutionMode,
    pub stream: StreamMetadata,
}
