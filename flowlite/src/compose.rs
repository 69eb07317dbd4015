//! Composition of sequence-transforming functions.
//!
//! A [`Transform`] is a reusable `Sequence<A> -> Sequence<B>` function. Chains
//! are built left to right with [`pipe!`](crate::pipe) or right to left with
//! [`compose!`](crate::compose); both reject an empty argument list at compile
//! time. [`pipe_all`] does the same for a runtime list of same-typed stages.

use crate::sequence::Sequence;
use flowlite_shared::errors::{FlowliteError, FlowliteResult};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

pub struct Transform<A, B> {
    apply: Arc<dyn Fn(Sequence<A>) -> Sequence<B> + Send + Sync>,
}

impl<A, B> Transform<A, B>
where
    A: Send + 'static,
    B: Send + 'static,
{
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Sequence<A>) -> Sequence<B> + Send + Sync + 'static,
    {
        Self { apply: Arc::new(f) }
    }

    pub fn apply(&self, input: Sequence<A>) -> Sequence<B> {
        (self.apply)(input)
    }

    /// `self` first, then `next`.
    pub fn then<C>(self, next: Transform<B, C>) -> Transform<A, C>
    where
        C: Send + 'static,
    {
        Transform::new(move |input| next.apply(self.apply(input)))
    }
}

impl<A, B> Clone for Transform<A, B> {
    fn clone(&self) -> Self {
        Self {
            apply: Arc::clone(&self.apply),
        }
    }
}

impl<A, B> fmt::Debug for Transform<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transform").finish_non_exhaustive()
    }
}

/// Pass-through transform.
pub fn identity<T: Send + 'static>() -> Transform<T, T> {
    Transform::new(|input| input)
}

/// Lift a plain function into an item-wise transform.
pub fn lift<A, B, F>(f: F) -> Transform<A, B>
where
    A: Send + 'static,
    B: Send + 'static,
    F: Fn(A) -> B + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Transform::new(move |input: Sequence<A>| {
        let f = Arc::clone(&f);
        input.map(move |item| f(item))
    })
}

/// Lift a fallible async function into an item-wise transform.
pub fn lift_async<A, B, F, Fut>(f: F) -> Transform<A, B>
where
    A: Send + 'static,
    B: Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FlowliteResult<B>> + Send + 'static,
{
    let f = Arc::new(f);
    Transform::new(move |input: Sequence<A>| {
        let f = Arc::clone(&f);
        input.transform(move |item| f(item))
    })
}

/// Lift a plain predicate into a filtering transform.
pub fn lift_filter<T, P>(predicate: P) -> Transform<T, T>
where
    T: Send + 'static,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    let predicate = Arc::new(predicate);
    Transform::new(move |input: Sequence<T>| {
        let predicate = Arc::clone(&predicate);
        input.filter(move |item| std::future::ready(Ok(predicate(item))))
    })
}

/// Lift a one-to-many function into a flattening transform.
pub fn lift_flat_map<A, B, I, F>(f: F) -> Transform<A, B>
where
    A: Send + 'static,
    B: Send + 'static,
    I: IntoIterator<Item = B> + Send + 'static,
    I::IntoIter: Send + 'static,
    F: Fn(A) -> I + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Transform::new(move |input: Sequence<A>| {
        let f = Arc::clone(&f);
        input.expand(move |item| std::future::ready(Ok(f(item))))
    })
}

/// Chain a runtime list of same-typed transforms left to right.
///
/// An empty list is rejected; a single transform is returned as is.
pub fn pipe_all<T: Send + 'static>(
    transforms: Vec<Transform<T, T>>,
) -> FlowliteResult<Transform<T, T>> {
    let mut iter = transforms.into_iter();
    let first = iter.next().ok_or_else(|| {
        FlowliteError::InvalidArgument("composition requires at least one transform".into())
    })?;
    Ok(iter.fold(first, Transform::then))
}

/// Left-to-right composition: `pipe!(f1, f2, f3)` applies `f1`, then `f2`, then `f3`.
#[macro_export]
macro_rules! pipe {
    () => {
        compile_error!("pipe! requires at least one transform")
    };
    ($only:expr $(,)?) => {
        $only
    };
    ($first:expr, $($rest:expr),+ $(,)?) => {
        $crate::compose::Transform::then($first, $crate::pipe!($($rest),+))
    };
}

/// Right-to-left composition: `compose!(f3, f2, f1)` applies `f1`, then `f2`, then `f3`.
#[macro_export]
macro_rules! compose {
    () => {
        compile_error!("compose! requires at least one transform")
    };
    ($only:expr $(,)?) => {
        $only
    };
    ($last:expr, $($rest:expr),+ $(,)?) => {
        $crate::compose::Transform::then($crate::compose!($($rest),+), $last)
    };
}
