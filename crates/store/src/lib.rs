//! Corral store: the `State` capability every subsystem talks to, plus an
//! in-memory engine with versioned writes and a watch stream.

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use corral_core::{Kind, Phase, Resource, ResourceKey, StateError, StateResult, WatchEvent};
use corral_search::LabelQuery;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

mod memory;

pub use memory::{MemoryConfig, MemoryState};

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// AND-combined label filters.
    pub label_queries: Vec<LabelQuery>,
    /// Restrict to one id (exact match).
    pub id: Option<String>,
}

impl ListOptions {
    pub fn with_label_query(mut self, q: LabelQuery) -> Self {
        self.label_queries.push(q);
        self
    }
}

#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Phase the stored resource must be in; `None` accepts any phase.
    pub expected_phase: Option<Phase>,
}

impl Default for UpdateOptions {
    fn default() -> Self { Self { expected_phase: Some(Phase::Running) } }
}

impl UpdateOptions {
    pub fn any_phase() -> Self { Self { expected_phase: None } }
}

#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Watch a single identity instead of the whole kind.
    pub id: Option<String>,
    /// Replay up to this many past events instead of bootstrapping current contents.
    pub tail_events: usize,
    pub label_queries: Vec<LabelQuery>,
}

/// Versioned, watchable resource store.
///
/// Mutations other than `create` compare against the stored version; the
/// store alone serializes conflicting writers.
#[async_trait]
pub trait State: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> StateResult<Resource>;

    async fn list(&self, kind: &Kind, opts: &ListOptions) -> StateResult<Vec<Resource>>;

    /// Store a new resource; the returned copy carries the assigned version.
    async fn create(&self, res: Resource) -> StateResult<Resource>;

    /// Replace the spec and labels of a resource whose version matches the stored one.
    /// Phase and finalizers are owned by the store and never taken from `res`.
    async fn update(&self, res: Resource, opts: UpdateOptions) -> StateResult<Resource>;

    /// Mark the resource pending deletion. Idempotent; returns whether no finalizers remain.
    async fn teardown(&self, key: &ResourceKey) -> StateResult<bool>;

    /// Remove the resource for good. Refused while finalizers remain.
    async fn destroy(&self, key: &ResourceKey) -> StateResult<()>;

    async fn add_finalizers(&self, key: &ResourceKey, finalizers: &[String]) -> StateResult<()>;

    async fn remove_finalizers(&self, key: &ResourceKey, finalizers: &[String]) -> StateResult<()>;

    /// Subscribe `sink` to events for `kind`. Returns once the subscription is
    /// registered; events flow until `cancel` fires or the sink is dropped.
    async fn watch(
        &self,
        kind: &Kind,
        opts: WatchOptions,
        sink: mpsc::Sender<WatchEvent>,
        cancel: CancellationToken,
    ) -> StateResult<()>;
}

#[async_trait]
impl<S: State + ?Sized> State for Arc<S> {
    async fn get(&self, key: &ResourceKey) -> StateResult<Resource> { (**self).get(key).await }

    async fn list(&self, kind: &Kind, opts: &ListOptions) -> StateResult<Vec<Resource>> { (**self).list(kind, opts).await }

    async fn create(&self, res: Resource) -> StateResult<Resource> { (**self).create(res).await }

    async fn update(&self, res: Resource, opts: UpdateOptions) -> StateResult<Resource> { (**self).update(res, opts).await }

    async fn teardown(&self, key: &ResourceKey) -> StateResult<bool> { (**self).teardown(key).await }

    async fn destroy(&self, key: &ResourceKey) -> StateResult<()> { (**self).destroy(key).await }

    async fn add_finalizers(&self, key: &ResourceKey, finalizers: &[String]) -> StateResult<()> {
        (**self).add_finalizers(key, finalizers).await
    }

    async fn remove_finalizers(&self, key: &ResourceKey, finalizers: &[String]) -> StateResult<()> {
        (**self).remove_finalizers(key, finalizers).await
    }

    async fn watch(
        &self,
        kind: &Kind,
        opts: WatchOptions,
        sink: mpsc::Sender<WatchEvent>,
        cancel: CancellationToken,
    ) -> StateResult<()> {
        (**self).watch(kind, opts, sink, cancel).await
    }
}

/// Suspend until an event for `key` satisfies `cond`, then return that event.
///
/// The first event is always the current state of `key` (`Destroyed` when it
/// does not exist), so a condition that already holds resolves immediately.
/// Cancelling `cancel` resolves to `StateError::Cancelled`.
pub async fn watch_for<S, F>(state: &S, key: &ResourceKey, cancel: &CancellationToken, cond: F) -> StateResult<WatchEvent>
where
    S: State + ?Sized,
    F: Fn(&WatchEvent) -> bool + Send,
{
    let scope = cancel.child_token();
    let _guard = scope.clone().drop_guard();
    let (tx, mut rx) = mpsc::channel(16);
    let opts = WatchOptions { id: Some(key.id.clone()), ..Default::default() };
    state.watch(&key.kind(), opts, tx, scope.clone()).await?;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(StateError::Cancelled),
            ev = rx.recv() => match ev {
                Some(WatchEvent::Errored(msg)) => return Err(StateError::Unavailable(msg)),
                Some(ev) if cond(&ev) => {
                    debug!(key = %key, event = ev.kind_str(), "state: watch_for condition met");
                    return Ok(ev);
                }
                Some(_) => continue,
                None if cancel.is_cancelled() => return Err(StateError::Cancelled),
                None => return Err(StateError::Unavailable(format!("watch on {} closed", key))),
            },
        }
    }
}

/// Condition used by the delete path: finalizers drained, or the resource is gone already.
pub fn finalizers_empty(ev: &WatchEvent) -> bool {
    match ev {
        WatchEvent::Destroyed(_) => true,
        WatchEvent::Created(r) | WatchEvent::Updated { new: r, .. } => r.metadata.finalizers.is_empty(),
        WatchEvent::Bootstrapped | WatchEvent::Errored(_) => false,
    }
}
