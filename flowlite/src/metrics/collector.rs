//! Per-sequence metrics collection.

use super::digest::CentroidDigest;
use super::snapshot::{LatencyStats, StreamMetadata};
use crate::options::MetricsOptions;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Timing record for one item, held only while the item is in flight.
#[derive(Debug, Clone, Copy)]
pub struct ItemMetrics {
    pub index: usize,
    pub start_time: Instant,
    pub end_time: Option<Instant>,
    pub duration_ms: Option<f64>,
    pub success: Option<bool>,
}

impl ItemMetrics {
    fn start(index: usize) -> Self {
        Self {
            index,
            start_time: Instant::now(),
            end_time: None,
            duration_ms: None,
            success: None,
        }
    }

    fn finish(mut self, success: bool) -> Self {
        let end = Instant::now();
        self.end_time = Some(end);
        self.duration_ms = Some(end.duration_since(self.start_time).as_secs_f64() * 1000.0);
        self.success = Some(success);
        self
    }
}

/// Metrics handle for one sequence.
///
/// Cheap to clone; all clones share state. One sequence writes to it, any
/// number of readers may take snapshots. Counters are atomics; the in-flight
/// map, digest and raw samples sit behind a single mutex.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<CollectorInner>,
}

#[derive(Debug)]
struct CollectorInner {
    created_at: Instant,
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    completed: AtomicBool,
    state: Mutex<CollectorState>,
}

#[derive(Debug)]
struct CollectorState {
    in_flight: HashMap<usize, ItemMetrics>,
    digest: CentroidDigest,
    samples: VecDeque<f64>,
    sample_capacity: usize,
    samples_evicted: bool,
    first_item_after: Option<Duration>,
    completed_at: Option<Instant>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(&MetricsOptions::default())
    }
}

impl MetricsCollector {
    pub fn new(options: &MetricsOptions) -> Self {
        let sample_capacity = options.sample_capacity.max(1);
        Self {
            inner: Arc::new(CollectorInner {
                created_at: Instant::now(),
                total: AtomicU64::new(0),
                succeeded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                completed: AtomicBool::new(false),
                state: Mutex::new(CollectorState {
                    in_flight: HashMap::new(),
                    digest: CentroidDigest::new(options.max_centroids),
                    samples: VecDeque::with_capacity(sample_capacity.min(1024)),
                    sample_capacity,
                    samples_evicted: false,
                    first_item_after: None,
                    completed_at: None,
                }),
            }),
        }
    }

    /// An item is being pulled.
    pub fn record_item_start(&self, index: usize) {
        self.inner.total.fetch_add(1, Ordering::Relaxed);
        self.inner
            .state
            .lock()
            .in_flight
            .insert(index, ItemMetrics::start(index));
    }

    /// An item was produced (`success`) or failed.
    pub fn record_item_end(&self, index: usize, success: bool) {
        let mut state = self.inner.state.lock();
        let Some(item) = state.in_flight.remove(&index) else {
            tracing::trace!(index, "Item end recorded without a matching start");
            return;
        };
        let item = item.finish(success);

        if success {
            self.inner.succeeded.fetch_add(1, Ordering::Relaxed);
            if state.first_item_after.is_none() {
                state.first_item_after = Some(self.inner.created_at.elapsed());
            }
        } else {
            self.inner.failed.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(duration_ms) = item.duration_ms {
            state.record_latency(duration_ms);
        }
    }

    /// An item was dropped without being fully processed.
    pub fn record_item_skipped(&self, index: usize) {
        self.inner.state.lock().in_flight.remove(&index);
        self.inner.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// A pull that turned out to be end-of-stream: forget it without counting.
    pub(crate) fn discard_item(&self, index: usize) {
        if self.inner.state.lock().in_flight.remove(&index).is_some() {
            self.inner.total.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Mark the observed sequence as finished. Later calls are no-ops.
    pub fn mark_complete(&self) {
        if self.inner.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.state.lock().completed_at = Some(Instant::now());
    }

    pub fn is_complete(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Number of items currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    pub fn snapshot(&self) -> StreamMetadata {
        let state = self.inner.state.lock();

        let end = state.completed_at.unwrap_or_else(Instant::now);
        let elapsed = end.duration_since(self.inner.created_at).as_secs_f64();
        let succeeded = self.inner.succeeded.load(Ordering::Relaxed);
        let failed = self.inner.failed.load(Ordering::Relaxed);
        let throughput_per_sec = if elapsed > 0.0 {
            (succeeded + failed) as f64 / elapsed
        } else {
            0.0
        };

        StreamMetadata {
            total_items: self.inner.total.load(Ordering::Relaxed),
            successful_items: succeeded,
            failed_items: failed,
            skipped_items: self.inner.skipped.load(Ordering::Relaxed),
            in_flight: state.in_flight.len(),
            time_to_first_item_ms: state.first_item_after.map(|d| d.as_secs_f64() * 1000.0),
            elapsed_ms: elapsed * 1000.0,
            throughput_per_sec,
            completed: self.is_complete(),
            latency: state.latency_stats(),
        }
    }
}

impl CollectorState {
    fn record_latency(&mut self, duration_ms: f64) {
        self.digest.add(duration_ms);
        if self.samples.len() == self.sample_capacity {
            self.samples.pop_front();
            self.samples_evicted = true;
        }
        self.samples.push_back(duration_ms);
    }

    /// Exact percentiles while every sample is still in the ring buffer,
    /// digest estimates afterwards.
    fn latency_stats(&self) -> LatencyStats {
        let (Some(min_ms), Some(max_ms), Some(mean_ms)) =
            (self.digest.min(), self.digest.max(), self.digest.mean())
        else {
            return LatencyStats::default();
        };

        let [p50_ms, p95_ms, p99_ms] = if self.samples_evicted {
            [0.5, 0.95, 0.99].map(|q| self.digest.quantile(q).unwrap_or(0.0))
        } else {
            let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
            sorted.sort_by(f64::total_cmp);
            [0.5, 0.95, 0.99].map(|q| nearest_rank(&sorted, q))
        };

        LatencyStats {
            count: self.digest.count(),
            min_ms,
            max_ms,
            mean_ms,
            p50_ms,
            p95_ms,
            p99_ms,
        }
    }
}

fn nearest_rank(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
