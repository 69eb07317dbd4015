//! External pull sources.

use async_trait::async_trait;
use flowlite_shared::errors::FlowliteResult;
use futures::Stream;

/// Anything that can be pulled item by item and closed.
///
/// Fixed collections, paginated APIs and infinite generators all implement
/// the same contract. `close` must tolerate being called after the source
/// has already returned `None`; the engine itself calls it at most once.
#[async_trait]
pub trait PullSource: Send + 'static {
    type Item: Send + 'static;

    /// Produce the next item, or `None` once the source is exhausted.
    async fn pull(&mut self) -> FlowliteResult<Option<Self::Item>>;

    /// Release resources held by the source.
    fn close(&mut self) -> FlowliteResult<()> {
        Ok(())
    }
}

/// Owns a source and closes it at most once, at the latest on drop.
struct SourceGuard<P: PullSource> {
    source: P,
    closed: bool,
}

impl<P: PullSource> SourceGuard<P> {
    fn new(source: P) -> Self {
        Self {
            source,
            closed: false,
        }
    }

    fn close(&mut self) -> FlowliteResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.source.close()
    }
}

impl<P: PullSource> Drop for SourceGuard<P> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "Failed to close source after early termination");
        }
    }
}

pub(super) fn source_stream<P: PullSource>(
    source: P,
) -> impl Stream<Item = FlowliteResult<P::Item>> + Send + 'static {
    // Owned by the generator from the start, so an unpolled stream still closes.
    let mut guard = SourceGuard::new(source);
    async_stream::stream! {
        loop {
            match guard.source.pull().await {
                Ok(Some(item)) => yield Ok(item),
                Ok(None) => {
                    if let Err(e) = guard.close() {
                        yield Err(e);
                    }
                    break;
                }
                Err(e) => {
                    // The pull error wins; a failing close is only reported.
                    if let Err(close_err) = guard.close() {
                        tracing::warn!(error = %close_err, "Failed to close source after pull error");
                    }
                    yield Err(e);
                    break;
                }
            }
        }
    }
}
