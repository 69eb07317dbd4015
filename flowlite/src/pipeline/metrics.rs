use crate::metrics::{MetricsCollector, StreamOperationMetadata};
use crate::pipeline::ExecutionMode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Per-step metrics of one pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    pub execution_id: Uuid,
    pub operations: Vec<StreamOperationMetadata>,
}

impl PipelineMetrics {
    pub fn operation(&self, name: &str) -> Option<&StreamOperationMetadata> {
        self.operations.iter().find(|op| op.operation == name)
    }

    /// Whether every instrumented step has finished.
    pub fn is_complete(&self) -> bool {
        self.operations.iter().all(|op| op.stream.completed)
    }

    pub fn log_summary(&self) {
        for op in &self.operations {
            let stream = &op.stream;
            tracing::info!(
                execution_id = %self.execution_id,
                step = %op.operation,
                execution = %op.execution,
                total = stream.total_items,
                succeeded = stream.successful_items,
                failed = stream.failed_items,
                skipped = stream.skipped_items,
                throughput_per_sec = format_args!("{:.1}", stream.throughput_per_sec),
                p50_ms = format_args!("{:.2}", stream.latency.p50_ms),
                p95_ms = format_args!("{:.2}", stream.latency.p95_ms),
                p99_ms = format_args!("{:.2}", stream.latency.p99_ms),
                "Step summary"
            );
        }
    }
}

/// Step identity shared by a pipeline and its runs.
#[derive(Debug, Clone)]
pub(crate) struct StepDescriptor {
    pub(crate) name: Arc<str>,
    pub(crate) execution: ExecutionMode,
}

/// Live view over the collectors of one run.
#[derive(Debug, Clone)]
pub struct RunMonitor {
    execution_id: Uuid,
    steps: Arc<[StepDescriptor]>,
    collectors: Arc<[Option<MetricsCollector>]>,
}

impl RunMonitor {
    pub(crate) fn new(
        execution_id: Uuid,
        steps: Arc<[StepDescriptor]>,
        collectors: Arc<[Option<MetricsCollector>]>,
    ) -> Self {
        Self {
            execution_id,
            steps,
            collectors,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn snapshot(&self) -> PipelineMetrics {
        let operations = self
            .steps
            .iter()
            .zip(self.collectors.iter())
            .enumerate()
            .filter_map(|(index, (step, collector))| {
                collector.as_ref().map(|collector| StreamOperationMetadata {
                    index,
                    operation: step.name.to_string(),
                    execution: step.execution,
                    stream: collector.snapshot(),
                })
            })
            .collect();

        PipelineMetrics {
            execution_id: self.execution_id,
            operations,
        }
    }
}
