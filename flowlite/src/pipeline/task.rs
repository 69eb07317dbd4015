//! Handler trait for the work a stage performs.

use super::state::StepContext;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Work performed by a [`Stage`](super::Stage) for a single item.
///
/// Implement this for stateful handlers (clients, caches); plain async
/// closures go through [`Stage::from_fn`](super::Stage::from_fn).
#[async_trait]
pub trait StageHandler<In, Out>: Send + Sync {
    /// Process one input. Errors are classified by the stage; use
    /// [`StageError::tagged`](super::StageError::tagged) to control the code.
    async fn execute(&self, input: In, ctx: &StepContext) -> anyhow::Result<Out>;
}

pub type BoxedHandler<In, Out> = Arc<dyn StageHandler<In, Out>>;

/// Adapter from an async closure to [`StageHandler`].
pub(crate) struct FnHandler<F, In, Out> {
    f: F,
    _types: PhantomData<fn(In) -> Out>,
}

impl<F, In, Out> FnHandler<F, In, Out> {
    pub(crate) fn new(f: F) -> Self {
        Self {
            f,
            _types: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, In, Out> StageHandler<In, Out> for FnHandler<F, In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
    F: Fn(In, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Out>> + Send + 'static,
{
    async fn execute(&self, input: In, ctx: &StepContext) -> anyhow::Result<Out> {
        (self.f)(input, ctx.clone()).await
    }
}
