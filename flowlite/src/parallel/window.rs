//! Windowed executor shared by the parallel operators.

use crate::sequence::Sequence;
use flowlite_shared::errors::{FlowliteError, FlowliteResult};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::future::Future;

/// Run `f` over `source` with at most `concurrency` items in the window.
///
/// `f` resolves to `Some(output)` to emit and `None` to drop the item.
/// `concurrency` must already be validated as non-zero.
pub(crate) fn run_window<T, U, F, Fut>(
    source: Sequence<T>,
    mut f: F,
    concurrency: usize,
    ordered: bool,
) -> Sequence<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = FlowliteResult<Option<U>>> + Send + 'static,
{
    debug_assert!(concurrency > 0);
    let mut source = source;

    Sequence::from_stream(async_stream::stream! {
        let mut in_flight: FuturesUnordered<BoxFuture<'static, (usize, FlowliteResult<Option<U>>)>> =
            FuturesUnordered::new();
        let mut completed: BTreeMap<usize, Option<U>> = BTreeMap::new();
        let mut admitted = 0usize;
        let mut released = 0usize;
        let mut exhausted = false;

        let failure = 'run: loop {
            let can_admit = !exhausted && admitted - released < concurrency;

            // Started work keeps progressing while the window waits on upstream.
            let event = tokio::select! {
                biased;
                Some((index, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    WindowEvent::Completed(index, result)
                }
                next = source.next(), if can_admit => WindowEvent::Pulled(next),
                else => WindowEvent::Drained,
            };

            match event {
                WindowEvent::Pulled(Some(Ok(item))) => {
                    let index = admitted;
                    let work = f(item);
                    in_flight.push(async move { (index, work.await) }.boxed());
                    admitted += 1;
                }
                WindowEvent::Pulled(Some(Err(e))) => break 'run Some(e),
                WindowEvent::Pulled(None) => exhausted = true,
                WindowEvent::Completed(index, Err(e)) => {
                    break 'run Some(FlowliteError::item(index, e));
                }
                WindowEvent::Completed(index, Ok(output)) if ordered => {
                    completed.insert(index, output);
                    while let Some(output) = completed.remove(&released) {
                        released += 1;
                        if let Some(value) = output {
                            yield Ok(value);
                        }
                    }
                }
                WindowEvent::Completed(_, Ok(output)) => {
                    released += 1;
                    if let Some(value) = output {
                        yield Ok(value);
                    }
                }
                WindowEvent::Drained => break 'run None,
            }
        };

        if let Some(e) = failure {
            tracing::debug!(
                error = %e,
                admitted,
                released,
                buffered = completed.len(),
                "Parallel operator failed, discarding buffered results"
            );
            source.close();
            completed.clear();
            detach_in_flight(in_flight);
            yield Err(e);
        }
    })
}

enum WindowEvent<T, U> {
    Pulled(Option<FlowliteResult<T>>),
    Completed(usize, FlowliteResult<Option<U>>),
    Drained,
}

/// Let already-started invocations finish on the runtime instead of cancelling them.
fn detach_in_flight<W>(in_flight: FuturesUnordered<W>)
where
    W: Future + Send + 'static,
    W::Output: Send + 'static,
{
    if in_flight.is_empty() {
        return;
    }

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            tracing::trace!(remaining = in_flight.len(), "Detaching in-flight work");
            handle.spawn(in_flight.for_each(|_| async {}));
        }
        Err(_) => {
            tracing::trace!(
                remaining = in_flight.len(),
                "No runtime available, dropping in-flight work"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::parallel::ParallelOptions;
    use crate::sequence::testing::CountingSource;
    use crate::sequence::{PullSource, Sequence};
    use async_trait::async_trait;
    use flowlite_shared::errors::{FlowliteError, FlowliteResult};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tokio::sync::Notify;

    /// Tracks how many invocations are running at once.
    #[derive(Clone, Default)]
    struct ActiveGauge {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl ActiveGauge {
        fn enter(&self) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    /// Yields `0..len` but holds item 1 back until the gate is opened.
    struct GatedSource {
        next: u64,
        len: u64,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl PullSource for GatedSource {
        type Item = u64;

        async fn pull(&mut self) -> FlowliteResult<Option<u64>> {
            if self.next >= self.len {
                return Ok(None);
            }
            if self.next == 1 {
                self.gate.notified().await;
            }
            let item = self.next;
            self.next += 1;
            Ok(Some(item))
        }
    }

    fn shuffled_latencies(n: u64, seed: u64) -> Vec<u64> {
        let mut latencies: Vec<u64> = (1..=n).collect();
        latencies.shuffle(&mut StdRng::seed_from_u64(seed));
        latencies
    }

    #[tokio::test]
    async fn test_ordered_matches_sequential_for_any_concurrency() {
        let latencies = shuffled_latencies(24, 7);
        let expected: Vec<u64> = latencies.iter().map(|ms| ms * 2).collect();

        for concurrency in [1, 2, 3, 8, 50] {
            let out = Sequence::from_items(latencies.clone())
                .parallel_transform(
                    |ms| async move {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        Ok(ms * 2)
                    },
                    ParallelOptions::ordered(concurrency),
                )
                .unwrap()
                .to_vec()
                .await
                .unwrap();
            assert_eq!(out, expected, "concurrency {concurrency}");
        }
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        for (concurrency, items) in [(3usize, 10u64), (10, 4), (1, 5)] {
            let gauge = ActiveGauge::default();
            let tracker = gauge.clone();

            let out = Sequence::from_items(0..items)
                .parallel_transform(
                    move |n| {
                        let tracker = tracker.clone();
                        async move {
                            tracker.enter();
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            tracker.exit();
                            Ok(n)
                        }
                    },
                    ParallelOptions::unordered(concurrency),
                )
                .unwrap()
                .to_vec()
                .await
                .unwrap();

            assert_eq!(out.len() as u64, items);
            assert_eq!(gauge.peak(), concurrency.min(items as usize));
        }
    }

    #[tokio::test]
    async fn test_unordered_emits_in_completion_order() {
        let out = Sequence::from_items(vec![120u64, 5, 60])
            .parallel_transform(
                |ms| async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(ms)
                },
                ParallelOptions::unordered(3),
            )
            .unwrap()
            .to_vec()
            .await
            .unwrap();
        assert_eq!(out, vec![5, 60, 120]);
    }

    #[tokio::test]
    async fn test_window_limits_source_pulls() {
        let source = CountingSource::new(100);
        let (pulls, closes) = source.counters();

        let mut seq = Sequence::from_source(source)
            .parallel_transform(|n| async move { Ok(n) }, ParallelOptions::ordered(4))
            .unwrap();

        assert_eq!(seq.pull().await.unwrap().unwrap(), 0);
        assert_eq!(seq.pull().await.unwrap().unwrap(), 1);
        assert!(pulls.load(Ordering::SeqCst) <= 2 + 4);

        drop(seq);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_fast_surfaces_first_failure() {
        let source = CountingSource::new(5);
        let (_, closes) = source.counters();
        let started = Instant::now();

        let result = Sequence::from_source(source)
            .map(|n| n + 1)
            .parallel_transform(
                |n| async move {
                    match n {
                        1 => {
                            tokio::time::sleep(Duration::from_millis(300)).await;
                            Ok(n)
                        }
                        3 => Err(FlowliteError::Internal("item 3 exploded".into())),
                        _ => Ok(n),
                    }
                },
                ParallelOptions::ordered(3),
            )
            .unwrap()
            .to_vec()
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.failed_index(), Some(2));
        assert!(err.to_string().contains("item 3 exploded"));
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_started_work_finishes_after_failure() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);

        let result = Sequence::from_items(vec![1u32, 2])
            .parallel_transform(
                move |n| {
                    let flag = Arc::clone(&flag);
                    async move {
                        if n == 2 {
                            return Err(FlowliteError::Internal("fail".into()));
                        }
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        flag.store(true, Ordering::SeqCst);
                        Ok(n)
                    }
                },
                ParallelOptions::ordered(2),
            )
            .unwrap()
            .to_vec()
            .await;

        assert!(result.is_err());
        assert!(!finished.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_parallel_filter_keeps_input_order() {
        let latencies = shuffled_latencies(20, 11);
        let expected: Vec<u64> = latencies.iter().copied().filter(|ms| ms % 2 == 0).collect();

        let out = Sequence::from_items(latencies)
            .parallel_filter(
                |ms| {
                    let ms = *ms;
                    async move {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        Ok(ms % 2 == 0)
                    }
                },
                5,
            )
            .unwrap()
            .to_vec()
            .await
            .unwrap();

        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_construction_error() {
        let err = Sequence::from_items(vec![1])
            .parallel_transform(|n| async move { Ok(n) }, ParallelOptions::ordered(0))
            .unwrap_err();
        assert!(err.is_construction_error());

        let err = Sequence::from_items(vec![1])
            .parallel_filter(|_| async { Ok(true) }, 0)
            .unwrap_err();
        assert!(err.is_construction_error());
    }

    #[tokio::test]
    async fn test_empty_source() {
        let out = Sequence::<u8>::empty()
            .parallel_transform(|n| async move { Ok(n) }, ParallelOptions::unordered(4))
            .unwrap()
            .to_vec()
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_started_work_progresses_while_source_waits() {
        let gate = Arc::new(Notify::new());
        let opener = Arc::clone(&gate);
        let source = GatedSource {
            next: 0,
            len: 4,
            gate,
        };

        let run = Sequence::from_source(source)
            .parallel_transform(
                move |n| {
                    let opener = Arc::clone(&opener);
                    async move {
                        if n == 0 {
                            tokio::task::yield_now().await;
                            opener.notify_one();
                        }
                        Ok(n)
                    }
                },
                ParallelOptions::ordered(4),
            )
            .unwrap()
            .to_vec();

        let out = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("window stalled waiting on the source")
            .unwrap();
        assert_eq!(out, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_chained_windows_overlap() {
        let gate = Arc::new(Notify::new());
        let waiter = Arc::clone(&gate);
        let opener = Arc::clone(&gate);
        let started = Instant::now();

        // Upstream item 1 only finishes once downstream item 0 has started.
        let run = Sequence::from_items(0..6u64)
            .parallel_transform(
                move |n| {
                    let waiter = Arc::clone(&waiter);
                    async move {
                        if n == 1 {
                            waiter.notified().await;
                        }
                        tokio::time::sleep(Duration::from_millis(40)).await;
                        Ok(n)
                    }
                },
                ParallelOptions::ordered(2),
            )
            .unwrap()
            .parallel_transform(
                move |n| {
                    let opener = Arc::clone(&opener);
                    async move {
                        if n == 0 {
                            opener.notify_one();
                        }
                        tokio::time::sleep(Duration::from_millis(40)).await;
                        Ok(n * 10)
                    }
                },
                ParallelOptions::ordered(2),
            )
            .unwrap()
            .to_vec();

        let out = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("chained windows did not overlap")
            .unwrap();
        assert_eq!(out, vec![0, 10, 20, 30, 40, 50]);
        assert!(started.elapsed() < Duration::from_millis(1000));
    }
}
