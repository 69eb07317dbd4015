//! Bounded-concurrency operators.
//!
//! ## Window
//!
//! ```text
//!            admitted ───────────────┐
//!   released ─────┐                  │
//!                 ▼                  ▼
//!   ... [done][done][ run ][done][ run ] | not yet pulled ...
//!                 └──── window ≤ concurrency ───┘
//! ```
//!
//! Work is admitted only while `admitted - released < concurrency`. In ordered
//! mode a completed item stays in the window until every earlier item has
//! been released, so the source is never pulled ahead of what the window
//! allows. In unordered mode items are released as they complete.
//!
//! ## Failure
//!
//! The first failure, in completion order, ends the operator: buffered results
//! are discarded, the source is closed and the error is surfaced wrapped in
//! [`FlowliteError::Item`]. Invocations that were already running are not
//! cancelled; they are handed to the tokio runtime to finish on their own.

mod window;

use crate::sequence::Sequence;
use flowlite_shared::errors::{FlowliteError, FlowliteResult};
use serde::{Deserialize, Serialize};
use std::future::Future;

pub(crate) use window::run_window;

/// Options for [`Sequence::parallel_transform`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelOptions {
    /// Upper bound on simultaneously running invocations.
    pub concurrency: usize,
    /// Emit results in input order (`true`) or completion order (`false`).
    pub ordered: bool,
}

impl ParallelOptions {
    pub fn ordered(concurrency: usize) -> Self {
        Self {
            concurrency,
            ordered: true,
        }
    }

    pub fn unordered(concurrency: usize) -> Self {
        Self {
            concurrency,
            ordered: false,
        }
    }

    pub fn validate(&self) -> FlowliteResult<()> {
        validate_concurrency(self.concurrency)
    }
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self::ordered(1)
    }
}

pub(crate) fn validate_concurrency(concurrency: usize) -> FlowliteResult<()> {
    if concurrency == 0 {
        return Err(FlowliteError::InvalidArgument(
            "concurrency must be a positive integer".into(),
        ));
    }
    Ok(())
}

impl<T: Send + 'static> Sequence<T> {
    /// Apply `f` with up to `options.concurrency` invocations in flight.
    pub fn parallel_transform<U, F, Fut>(
        self,
        mut f: F,
        options: ParallelOptions,
    ) -> FlowliteResult<Sequence<U>>
    where
        U: Send + 'static,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = FlowliteResult<U>> + Send + 'static,
    {
        options.validate()?;
        Ok(run_window(
            self,
            move |item| {
                let fut = f(item);
                async move { fut.await.map(Some) }
            },
            options.concurrency,
            options.ordered,
        ))
    }

    /// Evaluate `predicate` with up to `concurrency` evaluations in flight.
    ///
    /// Surviving items are always emitted in input order.
    pub fn parallel_filter<F, Fut>(
        self,
        mut predicate: F,
        concurrency: usize,
    ) -> FlowliteResult<Sequence<T>>
    where
        F: FnMut(&T) -> Fut + Send + 'static,
        Fut: Future<Output = FlowliteResult<bool>> + Send + 'static,
    {
        validate_concurrency(concurrency)?;
        Ok(run_window(
            self,
            move |item| {
                let fut = predicate(&item);
                async move { Ok(fut.await?.then_some(item)) }
            },
            concurrency,
            true,
        ))
    }
}
