//! Per-item pipeline state and the read-only context handed to steps.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type Entry = (Arc<str>, Arc<dyn Any + Send + Sync>);

/// Outputs of the steps an item has already passed through, in step order.
///
/// Cloning is O(1); the entry list is copied only when a shared state is
/// written to.
#[derive(Clone, Default)]
pub struct PipelineState {
    entries: Arc<Vec<Entry>>,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output recorded by step `name`, if it ran and produced a `T`.
    pub fn get<T: Any>(&self, name: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|(step, _)| step.as_ref() == name)
            .and_then(|(_, value)| value.downcast_ref::<T>())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(step, _)| step.as_ref() == name)
    }

    /// Step names in the order they were recorded.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(step, _)| step.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn record<T: Any + Send + Sync>(&mut self, step: Arc<str>, value: T) {
        Arc::make_mut(&mut self.entries).push((step, Arc::new(value)));
    }
}

impl fmt::Debug for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// An item travelling through a pipeline together with its state.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub value: T,
    pub state: PipelineState,
}

impl<T> Envelope<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            state: PipelineState::new(),
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

/// Dependencies injected into a pipeline, looked up by type.
#[derive(Default)]
pub struct Resources {
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `value`, replacing any earlier resource of the same type.
    pub fn insert<R: Any + Send + Sync>(&mut self, value: R) {
        self.values.insert(TypeId::of::<R>(), Arc::new(value));
    }

    pub fn get<R: Any>(&self) -> Option<&R> {
        self.values
            .get(&TypeId::of::<R>())
            .and_then(|value| value.downcast_ref::<R>())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resources")
            .field("count", &self.values.len())
            .finish()
    }
}

/// What a step sees while it runs: its own name, the item's prior state and
/// the pipeline's resources. Never modified during the step.
#[derive(Debug, Clone)]
pub struct StepContext {
    step: Arc<str>,
    state: PipelineState,
    resources: Arc<Resources>,
}

impl StepContext {
    pub(crate) fn new(step: Arc<str>, state: PipelineState, resources: Arc<Resources>) -> Self {
        Self {
            step,
            state,
            resources,
        }
    }

    /// Context for invoking a stage outside of a pipeline.
    pub fn detached(step: &str) -> Self {
        Self::new(Arc::from(step), PipelineState::new(), Arc::new(Resources::new()))
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Shortcut for `state().get(name)`.
    pub fn get<T: Any>(&self, name: &str) -> Option<&T> {
        self.state.get(name)
    }

    pub fn resource<R: Any>(&self) -> Option<&R> {
        self.resources.get::<R>()
    }
}
