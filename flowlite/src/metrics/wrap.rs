//! Transparent metrics wrapper for any sequence.

use super::collector::MetricsCollector;
use crate::sequence::Sequence;
use async_stream::stream;
use futures::StreamExt;

/// Record per-item timing for `source` into `collector`.
///
/// The returned sequence yields exactly what `source` yields. Each pull is
/// timed from request to result. A pull still pending when the consumer
/// stops is counted as skipped. The collector is marked complete when the
/// wrapper finishes, fails, or is dropped.
pub fn wrap_with_metrics<T: Send + 'static>(
    mut source: Sequence<T>,
    collector: MetricsCollector,
) -> Sequence<T> {
    let mut guard = CompletionGuard {
        collector: collector.clone(),
        pending: None,
    };

    Sequence::from_stream(stream! {
        let mut index = 0usize;

        loop {
            collector.record_item_start(index);
            guard.pending = Some(index);
            let next = source.next().await;
            guard.pending = None;

            match next {
                Some(Ok(item)) => {
                    collector.record_item_end(index, true);
                    index += 1;
                    yield Ok(item);
                }
                Some(Err(e)) => {
                    collector.record_item_end(index, false);
                    source.close();
                    yield Err(e);
                    break;
                }
                None => {
                    collector.discard_item(index);
                    break;
                }
            }
        }
    })
}

struct CompletionGuard {
    collector: MetricsCollector,
    pending: Option<usize>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(index) = self.pending.take() {
            self.collector.record_item_skipped(index);
        }
        self.collector.mark_complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::testing::CountingSource;
    use flowlite_shared::errors::FlowliteError;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wrap_is_transparent() {
        let collector = MetricsCollector::default();
        let out = wrap_with_metrics(Sequence::from_items(1..=20u32), collector.clone())
            .to_vec()
            .await
            .unwrap();

        assert_eq!(out, (1..=20).collect::<Vec<_>>());

        let snapshot = collector.snapshot();
        assert!(snapshot.completed);
        assert_eq!(snapshot.total_items, 20);
        assert_eq!(snapshot.successful_items, 20);
        assert_eq!(snapshot.failed_items, 0);
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.latency.count, 20);
    }

    #[tokio::test]
    async fn test_error_marks_failure_and_complete() {
        let source = CountingSource::new(10).failing_at(3);
        let (_, closes) = source.counters();
        let collector = MetricsCollector::default();

        let err = wrap_with_metrics(Sequence::from_source(source), collector.clone())
            .to_vec()
            .await
            .unwrap_err();
        assert!(matches!(err, FlowliteError::Source(_)));

        let snapshot = collector.snapshot();
        assert!(snapshot.completed);
        assert_eq!(snapshot.successful_items, 3);
        assert_eq!(snapshot.failed_items, 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_early_stop_closes_once_and_completes() {
        let source = CountingSource::new(100);
        let (pulls, closes) = source.counters();
        let collector = MetricsCollector::default();

        let out = wrap_with_metrics(Sequence::from_source(source), collector.clone())
            .limit(5)
            .to_vec()
            .await
            .unwrap();

        assert_eq!(out.len(), 5);
        assert_eq!(pulls.load(Ordering::SeqCst), 5);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(collector.is_complete());
        assert_eq!(collector.snapshot().successful_items, 5);
    }

    #[tokio::test]
    async fn test_pending_pull_counted_as_skipped() {
        let collector = MetricsCollector::default();
        let slow = Sequence::from_items(0..3u32).transform(|x| async move {
            tokio::time::sleep(Duration::from_millis(if x == 1 { 200 } else { 0 })).await;
            Ok(x)
        });
        let mut wrapped = wrap_with_metrics(slow, collector.clone());

        assert_eq!(wrapped.pull().await.unwrap().unwrap(), 0);
        let pending = tokio::time::timeout(Duration::from_millis(20), wrapped.pull()).await;
        assert!(pending.is_err());
        drop(wrapped);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.successful_items, 1);
        assert_eq!(snapshot.skipped_items, 1);
        assert_eq!(snapshot.in_flight, 0);
        assert!(snapshot.completed);
    }

    #[test]
    fn test_unpolled_wrapper_completes_on_drop() {
        let source = CountingSource::new(10);
        let (pulls, closes) = source.counters();
        let collector = MetricsCollector::default();

        drop(wrap_with_metrics(Sequence::from_source(source), collector.clone()));

        assert!(collector.is_complete());
        assert_eq!(collector.snapshot().total_items, 0);
        assert_eq!(pulls.load(Ordering::SeqCst), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
