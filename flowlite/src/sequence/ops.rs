//! Sequential operators.
//!
//! Each operator suspends on its upstream pull and on any async callback,
//! preserves input order, and closes its upstream on completion, error or drop.

use super::Sequence;
use async_stream::try_stream;
use flowlite_shared::errors::{FlowliteError, FlowliteResult};
use futures::StreamExt;
use std::future::Future;

impl<T: Send + 'static> Sequence<T> {
    /// Apply `f` to each item in order, awaiting each call before pulling the next.
    pub fn transform<U, F, Fut>(self, mut f: F) -> Sequence<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = FlowliteResult<U>> + Send + 'static,
    {
        let mut source = self;
        Sequence::from_stream(try_stream! {
            while let Some(item) = source.next().await {
                let output = f(item?).await?;
                yield output;
            }
        })
    }

    /// Synchronous one-to-one mapping.
    pub fn map<U, F>(self, mut f: F) -> Sequence<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        Sequence::from_stream(StreamExt::map(self, move |item| item.map(&mut f)))
    }

    /// Keep items for which `predicate` resolves to `true`.
    pub fn filter<F, Fut>(self, mut predicate: F) -> Sequence<T>
    where
        F: FnMut(&T) -> Fut + Send + 'static,
        Fut: Future<Output = FlowliteResult<bool>> + Send + 'static,
    {
        let mut source = self;
        Sequence::from_stream(try_stream! {
            while let Some(item) = source.next().await {
                let item = item?;
                if predicate(&item).await? {
                    yield item;
                }
            }
        })
    }

    /// Map each item to zero or more outputs, flattened in input order.
    pub fn expand<U, I, F, Fut>(self, mut f: F) -> Sequence<U>
    where
        U: Send + 'static,
        I: IntoIterator<Item = U> + Send,
        I::IntoIter: Send + 'static,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = FlowliteResult<I>> + Send + 'static,
    {
        let mut source = self;
        Sequence::from_stream(try_stream! {
            while let Some(item) = source.next().await {
                for output in f(item?).await? {
                    yield output;
                }
            }
        })
    }

    /// Group items into vectors of `size`; the last group may be shorter.
    ///
    /// A zero `size` is rejected here rather than when the sequence runs.
    pub fn batch(self, size: usize) -> FlowliteResult<Sequence<Vec<T>>> {
        if size == 0 {
            return Err(FlowliteError::InvalidArgument(
                "batch size must be a positive integer".into(),
            ));
        }

        let mut source = self;
        Ok(Sequence::from_stream(try_stream! {
            let mut group = Vec::with_capacity(size);
            while let Some(item) = source.next().await {
                group.push(item?);
                if group.len() == size {
                    yield std::mem::replace(&mut group, Vec::with_capacity(size));
                }
            }
            if !group.is_empty() {
                yield group;
            }
        }))
    }

    /// Run `f` on each item as a side effect; the stream is unchanged.
    pub fn observe<F>(self, mut f: F) -> Sequence<T>
    where
        F: FnMut(&T) + Send + 'static,
    {
        Sequence::from_stream(StreamExt::inspect(self, move |item| {
            if let Ok(item) = item {
                f(item);
            }
        }))
    }

    /// Yield at most `n` items.
    ///
    /// Upstream is closed as soon as the `n`th item is in hand, before it is
    /// handed to the consumer, so nothing further is ever pulled.
    pub fn limit(self, n: usize) -> Sequence<T> {
        let mut source = self;
        Sequence::from_stream(try_stream! {
            let mut taken = 0;
            if n == 0 {
                source.close();
            }
            while taken < n {
                let Some(item) = source.next().await else {
                    break;
                };
                let item = item?;
                taken += 1;
                if taken == n {
                    source.close();
                }
                yield item;
            }
        })
    }

    /// Skip the first `n` items.
    pub fn skip(self, n: usize) -> Sequence<T> {
        let mut source = self;
        Sequence::from_stream(try_stream! {
            let mut skipped = 0;
            while let Some(item) = source.next().await {
                let item = item?;
                if skipped < n {
                    skipped += 1;
                    continue;
                }
                yield item;
            }
        })
    }

    /// Skip items while `predicate` holds; once it fails, everything passes.
    pub fn skip_while<F, Fut>(self, mut predicate: F) -> Sequence<T>
    where
        F: FnMut(&T) -> Fut + Send + 'static,
        Fut: Future<Output = FlowliteResult<bool>> + Send + 'static,
    {
        let mut source = self;
        Sequence::from_stream(try_stream! {
            let mut skipping = true;
            while let Some(item) = source.next().await {
                let item = item?;
                if skipping {
                    if predicate(&item).await? {
                        continue;
                    }
                    skipping = false;
                }
                yield item;
            }
        })
    }
}
