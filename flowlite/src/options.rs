//! Engine configuration.

use crate::metrics::digest::DEFAULT_MAX_CENTROIDS;
use flowlite_shared::errors::{FlowliteError, FlowliteResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_SAMPLE_CAPACITY: usize = 10_000;

/// Options applied to a whole pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Concurrency used by a parallel step that does not declare one.
    pub default_concurrency: usize,
    /// Wrap every step with a [`MetricsCollector`](crate::metrics::MetricsCollector).
    pub collect_metrics: bool,
    pub metrics: MetricsOptions,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            default_concurrency: 1,
            collect_metrics: true,
            metrics: MetricsOptions::default(),
        }
    }
}

impl PipelineOptions {
    pub fn from_json(json: &str) -> FlowliteResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| FlowliteError::Config(format!("invalid pipeline options: {e}")))
    }

    /// Reject values the engine cannot run with.
    pub fn sanitize(&self) -> FlowliteResult<()> {
        if self.default_concurrency == 0 {
            return Err(FlowliteError::Config(
                "default_concurrency must be a positive integer".into(),
            ));
        }
        self.metrics.sanitize()
    }
}

/// Sizing of per-step metrics collectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsOptions {
    /// Centroid cap of the percentile digest.
    pub max_centroids: usize,
    /// Raw latency samples kept for exact percentiles before the digest takes over.
    pub sample_capacity: usize,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            max_centroids: DEFAULT_MAX_CENTROIDS,
            sample_capacity: DEFAULT_SAMPLE_CAPACITY,
        }
    }
}

impl MetricsOptions {
    pub fn sanitize(&self) -> FlowliteResult<()> {
        if self.max_centroids < 2 {
            return Err(FlowliteError::Config(format!(
                "max_centroids must be at least 2, got {}",
                self.max_centroids
            )));
        }
        if self.sample_capacity == 0 {
            return Err(FlowliteError::Config(
                "sample_capacity must be a positive integer".into(),
            ));
        }
        Ok(())
    }
}

/// Options for [`init_logging`](crate::logging::init_logging).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `"info"` or `"flowlite=debug"`.
    pub level: String,
    /// Write to a daily rolling file in this directory instead of stderr.
    pub log_dir: Option<PathBuf>,
    pub ansi: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".into(),
            log_dir: None,
            ansi: true,
        }
    }
}
