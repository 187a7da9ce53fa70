//! Corral controllers: the two controller shapes, a write-once registry and
//! the engine that drives them off store watches.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corral_core::{Kind, Resource, ResourceKey, StateResult, WatchEvent};
use corral_store::{ListOptions, State, UpdateOptions};
use tokio_util::sync::CancellationToken;

mod counters;
mod engine;
mod queue;
mod registry;

pub use counters::{ControllerCounters, Counter, ExposesCounters, QueueCounters};
pub use engine::Engine;
pub use registry::{Registry, RegistryBuilder, RegistryError};

/// Unit of work for a queue controller.
pub type WorkKey = ResourceKey;

/// Controller that reconciles everything it owns whenever any input changes.
#[async_trait]
pub trait Controller: Send + Sync {
    fn name(&self) -> &str;

    /// Kinds whose changes wake this controller.
    fn inputs(&self) -> Vec<Kind>;

    async fn reconcile(&self, ctx: &Context) -> anyhow::Result<()>;

    /// Controller-specific counters exported next to the engine's.
    fn counters(&self) -> Option<Arc<dyn ExposesCounters>> { None }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    /// Workers draining the queue.
    pub concurrency: usize,
    /// Pending keys kept; the oldest is dropped beyond this.
    pub capacity: usize,
    pub requeue_base: Duration,
    pub requeue_max: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { concurrency: 1, capacity: 1024, requeue_base: Duration::from_millis(100), requeue_max: Duration::from_secs(10) }
    }
}

/// Controller that maps input events to keys and reconciles one key at a time.
#[async_trait]
pub trait QueueController: Send + Sync {
    fn name(&self) -> &str;

    fn inputs(&self) -> Vec<Kind>;

    fn settings(&self) -> QueueSettings { QueueSettings::default() }

    /// Fan an input event out to the keys that need reconciling. Defaults to
    /// the event's own resource.
    async fn map_input(&self, _ctx: &Context, ev: &WatchEvent) -> anyhow::Result<Vec<WorkKey>> {
        Ok(ev.resource().map(|r| vec![r.key()]).unwrap_or_default())
    }

    async fn reconcile(&self, ctx: &Context, key: &WorkKey) -> anyhow::Result<()>;

    fn counters(&self) -> Option<Arc<dyn ExposesCounters>> { None }
}

/// Store handle given to controllers. Reads and writes made through it are
/// counted against the owning controller.
#[derive(Clone)]
pub struct Context {
    state: Arc<dyn State>,
    cancel: CancellationToken,
    counters: Option<Arc<ControllerCounters>>,
}

impl Context {
    pub fn new(state: Arc<dyn State>, cancel: CancellationToken) -> Self { Self { state, cancel, counters: None } }

    pub(crate) fn with_counters(mut self, counters: Arc<ControllerCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn state(&self) -> &Arc<dyn State> { &self.state }

    /// Cancelled when the engine stops.
    pub fn cancel(&self) -> &CancellationToken { &self.cancel }

    fn read(&self) { if let Some(c) = &self.counters { c.inc_reads(); } }

    fn wrote(&self) { if let Some(c) = &self.counters { c.inc_writes(); } }

    pub async fn get(&self, key: &ResourceKey) -> StateResult<Resource> {
        self.read();
        self.state.get(key).await
    }

    pub async fn list(&self, kind: &Kind, opts: &ListOptions) -> StateResult<Vec<Resource>> {
        self.read();
        self.state.list(kind, opts).await
    }

    pub async fn create(&self, res: Resource) -> StateResult<Resource> {
        self.wrote();
        self.state.create(res).await
    }

    pub async fn update(&self, res: Resource, opts: UpdateOptions) -> StateResult<Resource> {
        self.wrote();
        self.state.update(res, opts).await
    }

    pub async fn teardown(&self, key: &ResourceKey) -> StateResult<bool> {
        self.wrote();
        self.state.teardown(key).await
    }

    pub async fn destroy(&self, key: &ResourceKey) -> StateResult<()> {
        self.wrote();
        self.state.destroy(key).await
    }

    pub async fn add_finalizers(&self, key: &ResourceKey, finalizers: &[String]) -> StateResult<()> {
        self.wrote();
        self.state.add_finalizers(key, finalizers).await
    }

    pub async fn remove_finalizers(&self, key: &ResourceKey, finalizers: &[String]) -> StateResult<()> {
        self.wrote();
        self.state.remove_finalizers(key, finalizers).await
    }
}
