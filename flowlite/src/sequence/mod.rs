//! Lazy, pull-based sequences.
//!
//! A [`Sequence`] is a single-pass producer of `FlowliteResult<T>` values. It is
//! owned by exactly one consumer and is driven by polling it as a
//! [`futures::Stream`]. Every operator consumes its input sequence and returns
//! a new one that pulls from the input on demand.
//!
//! ## Closing discipline
//!
//! ```text
//! source ──▶ transform ──▶ filter ──▶ limit ──▶ consumer
//!   ▲            ▲            ▲          │
//!   └────────────┴────────────┴──────────┘  drop / close / error
//! ```
//!
//! A sequence releases its upstream chain when it is exhausted, when it yields
//! an error, when [`Sequence::close`] is called, or when it is dropped. Each
//! release happens once: the inner stream is taken out of the `Option` and
//! dropped, which in turn drops every upstream stage. Closing twice is a no-op.

mod ops;
mod source;

pub use source::PullSource;

use flowlite_shared::errors::FlowliteResult;
use futures::stream::{self, BoxStream, FusedStream, Stream, StreamExt};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub struct Sequence<T> {
    stream: Option<BoxStream<'static, FlowliteResult<T>>>,
}

impl<T> Sequence<T> {
    /// Release the upstream chain without pulling further.
    ///
    /// Idempotent. Any later pull yields `None`.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            tracing::trace!("Sequence closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

// ============================================================================
// SOURCES
// ============================================================================

impl<T: Send + 'static> Sequence<T> {
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = FlowliteResult<T>> + Send + 'static,
    {
        Self {
            stream: Some(stream.boxed()),
        }
    }

    pub fn empty() -> Self {
        Self::from_stream(stream::empty())
    }

    /// Sequence over a fixed collection (or any `Send` iterator, consumed lazily).
    pub fn from_items<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::from_stream(stream::iter(items.into_iter().map(Ok)))
    }

    /// Like [`Sequence::from_items`], but items may already be failures.
    ///
    /// The first `Err` terminates the sequence.
    pub fn from_results<I>(items: I) -> Self
    where
        I: IntoIterator<Item = FlowliteResult<T>>,
        I::IntoIter: Send + 'static,
    {
        Self::from_stream(stream::iter(items))
    }

    /// Sequence fed by a bounded channel; ends when every sender is dropped.
    ///
    /// Dropping the sequence drops the receiver, so producers observe the
    /// close as a send error.
    pub fn from_receiver(receiver: mpsc::Receiver<T>) -> Self {
        Self::from_stream(ReceiverStream::new(receiver).map(Ok))
    }

    /// Sequence over an external pull source.
    ///
    /// The source's `close` runs exactly once: on exhaustion, on a pull error,
    /// or when the sequence is dropped early.
    pub fn from_source<P>(source: P) -> Self
    where
        P: PullSource<Item = T>,
    {
        Self::from_stream(source::source_stream(source))
    }

    /// Generative sequence driven by a state machine.
    ///
    /// `step` returns the next item and the next state, or `None` to finish.
    /// Infinite generators are fine; bound them downstream with `limit`.
    pub fn unfold<S, F, Fut>(init: S, step: F) -> Self
    where
        S: Send + 'static,
        F: FnMut(S) -> Fut + Send + 'static,
        Fut: Future<Output = FlowliteResult<Option<(T, S)>>> + Send + 'static,
    {
        Self::from_stream(stream::unfold(Some((init, step)), |slot| async move {
            let Some((state, mut step)) = slot else {
                return None;
            };
            match step(state).await {
                Ok(Some((item, next))) => Some((Ok(item), Some((next, step)))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        }))
    }
}

// ============================================================================
// TERMINALS
// ============================================================================

impl<T: Send + 'static> Sequence<T> {
    /// Pull the next item.
    pub async fn pull(&mut self) -> Option<FlowliteResult<T>> {
        self.next().await
    }

    /// Drain into an ordered list. The first error aborts the drain.
    pub async fn to_vec(mut self) -> FlowliteResult<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Fold left to right into a single value.
    pub async fn reduce<A, F>(mut self, init: A, mut reducer: F) -> FlowliteResult<A>
    where
        F: FnMut(A, T) -> A,
    {
        let mut acc = init;
        while let Some(item) = self.next().await {
            acc = reducer(acc, item?);
        }
        Ok(acc)
    }

    /// Drive the sequence for side effects only.
    ///
    /// An `Err` from `f` stops consumption, closes the chain and is returned.
    pub async fn for_each<F>(mut self, mut f: F) -> FlowliteResult<()>
    where
        F: FnMut(T, usize) -> FlowliteResult<()>,
    {
        let mut index = 0;
        while let Some(item) = self.next().await {
            if let Err(err) = f(item?, index) {
                self.close();
                return Err(err);
            }
            index += 1;
        }
        Ok(())
    }
}

impl<T> Stream for Sequence<T> {
    type Item = FlowliteResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(stream) = this.stream.as_mut() else {
            return Poll::Ready(None);
        };

        match stream.poll_next_unpin(cx) {
            Poll::Ready(None) => {
                this.stream = None;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(err))) => {
                // An error ends the sequence; release upstream before surfacing it.
                this.stream = None;
                Poll::Ready(Some(Err(err)))
            }
            other => other,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.stream {
            Some(stream) => stream.size_hint(),
            None => (0, Some(0)),
        }
    }
}

impl<T> FusedStream for Sequence<T> {
    fn is_terminated(&self) -> bool {
        self.stream.is_none()
    }
}

impl<T> fmt::Debug for Sequence<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequence")
            .field("closed", &self.is_closed())
            .finish()
    }
}
