//! In-memory `State` engine.
//!
//! Writers serialize on a mutex and publish every applied change to a
//! broadcast channel and a bounded history ring (used for tail replay).
//! Lists read an `ArcSwap`ped snapshot that is rebuilt lazily once per write
//! epoch.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::Utc;
use corral_core::{Kind, Phase, Resource, ResourceKey, ResourceMetadata, StateError, StateResult, Version, WatchEvent};
use corral_search::{matches_all, LabelQuery};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{ListOptions, State, UpdateOptions, WatchOptions};

#[derive(Debug, Clone, Copy)]
pub struct MemoryConfig {
    /// Past events kept for tail replay.
    pub history: usize,
    /// Live events a slow watcher may fall behind before its stream is errored.
    pub buffer: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self { Self { history: 1024, buffer: 1024 } }
}

struct Inner {
    resources: BTreeMap<ResourceKey, Resource>,
    history: VecDeque<Arc<WatchEvent>>,
}

#[derive(Default)]
struct Snapshot {
    epoch: u64,
    items: Vec<Resource>,
}

pub struct MemoryState {
    inner: Mutex<Inner>,
    epoch: AtomicU64,
    snap: ArcSwap<Snapshot>,
    tx: broadcast::Sender<Arc<WatchEvent>>,
    cfg: MemoryConfig,
}

impl Default for MemoryState {
    fn default() -> Self { Self::new(MemoryConfig::default()) }
}

impl MemoryState {
    pub fn new(cfg: MemoryConfig) -> Self {
        let (tx, _) = broadcast::channel(cfg.buffer.max(1));
        Self {
            inner: Mutex::new(Inner { resources: BTreeMap::new(), history: VecDeque::with_capacity(cfg.history.min(4096)) }),
            epoch: AtomicU64::new(0),
            snap: ArcSwap::from_pointee(Snapshot::default()),
            tx,
            cfg,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Record an applied change. Must be called with the lock held so that
    /// subscription + snapshot in `watch` never straddle a write.
    fn publish(&self, inner: &mut Inner, ev: WatchEvent) {
        let ev = Arc::new(ev);
        if self.cfg.history > 0 {
            if inner.history.len() >= self.cfg.history { inner.history.pop_front(); }
            inner.history.push_back(Arc::clone(&ev));
        }
        self.epoch.fetch_add(1, Ordering::Release);
        metrics::counter!("state_events_total", 1, "kind" => ev.kind_str());
        // No receivers is fine.
        let _ = self.tx.send(ev);
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        let cur = self.snap.load_full();
        if cur.epoch == self.epoch.load(Ordering::Acquire) { return cur; }
        let inner = self.lock();
        let epoch = self.epoch.load(Ordering::Acquire);
        let next = Arc::new(Snapshot { epoch, items: inner.resources.values().cloned().collect() });
        drop(inner);
        metrics::gauge!("state_resources", next.items.len() as f64);
        self.snap.store(Arc::clone(&next));
        next
    }
}

/// Which events a subscription forwards.
#[derive(Clone)]
struct Filter {
    kind: Kind,
    id: Option<String>,
    queries: Vec<LabelQuery>,
}

impl Filter {
    fn matches_resource(&self, r: &Resource) -> bool {
        let md = &r.metadata;
        md.namespace == self.kind.namespace
            && md.resource_type == self.kind.resource_type
            && self.id.as_deref().map(|id| md.id == id).unwrap_or(true)
            && matches_all(&self.queries, &md.labels)
    }

    /// The event as a subscriber with this filter must see it, if at all.
    ///
    /// An update that moves a resource into the selection reads as `Created`,
    /// one that moves it out reads as `Destroyed` of the last matching state.
    fn project(&self, ev: &WatchEvent) -> Option<WatchEvent> {
        match ev {
            WatchEvent::Updated { old, new } => match (self.matches_resource(old), self.matches_resource(new)) {
                (true, true) => Some(ev.clone()),
                (false, true) => Some(WatchEvent::Created(new.clone())),
                (true, false) => Some(WatchEvent::Destroyed(old.clone())),
                (false, false) => None,
            },
            WatchEvent::Created(r) | WatchEvent::Destroyed(r) => self.matches_resource(r).then(|| ev.clone()),
            WatchEvent::Bootstrapped | WatchEvent::Errored(_) => None,
        }
    }
}

fn tombstone(key: &ResourceKey) -> Resource {
    Resource::new(ResourceMetadata::new(key.namespace.clone(), key.resource_type.clone(), key.id.clone()), serde_json::Value::Null)
}

#[async_trait]
impl State for MemoryState {
    async fn get(&self, key: &ResourceKey) -> StateResult<Resource> {
        self.lock().resources.get(key).cloned().ok_or_else(|| StateError::NotFound(key.clone()))
    }

    async fn list(&self, kind: &Kind, opts: &ListOptions) -> StateResult<Vec<Resource>> {
        let snap = self.snapshot();
        let filter = Filter { kind: kind.clone(), id: opts.id.clone(), queries: opts.label_queries.clone() };
        let out: Vec<Resource> = snap.items.iter().filter(|r| filter.matches_resource(r)).cloned().collect();
        metrics::counter!("state_ops_total", 1, "op" => "list");
        Ok(out)
    }

    async fn create(&self, mut res: Resource) -> StateResult<Resource> {
        let key = res.key();
        let mut inner = self.lock();
        if inner.resources.contains_key(&key) {
            return Err(StateError::AlreadyExists(key));
        }
        let now = Utc::now();
        res.metadata.version = Version::initial();
        res.metadata.phase = Phase::Running;
        res.metadata.created = Some(now);
        res.metadata.updated = Some(now);
        inner.resources.insert(key.clone(), res.clone());
        self.publish(&mut inner, WatchEvent::Created(res.clone()));
        drop(inner);
        metrics::counter!("state_ops_total", 1, "op" => "create");
        debug!(key = %key, version = %res.metadata.version, "state: created");
        Ok(res)
    }

    async fn update(&self, mut res: Resource, opts: UpdateOptions) -> StateResult<Resource> {
        let key = res.key();
        let mut inner = self.lock();
        let cur = inner.resources.get(&key).ok_or_else(|| StateError::NotFound(key.clone()))?;
        if res.metadata.version != cur.metadata.version {
            return Err(StateError::VersionConflict { key, expected: res.metadata.version, actual: cur.metadata.version });
        }
        if let Some(expected) = opts.expected_phase {
            if cur.metadata.phase != expected {
                return Err(StateError::PhaseConflict { key, expected, actual: cur.metadata.phase });
            }
        }
        let old = cur.clone();
        res.metadata.version = old.metadata.version.next();
        res.metadata.phase = old.metadata.phase;
        res.metadata.finalizers = old.metadata.finalizers.clone();
        res.metadata.created = old.metadata.created;
        res.metadata.updated = Some(Utc::now());
        inner.resources.insert(key.clone(), res.clone());
        self.publish(&mut inner, WatchEvent::Updated { old, new: res.clone() });
        drop(inner);
        metrics::counter!("state_ops_total", 1, "op" => "update");
        debug!(key = %key, version = %res.metadata.version, "state: updated");
        Ok(res)
    }

    async fn teardown(&self, key: &ResourceKey) -> StateResult<bool> {
        let mut inner = self.lock();
        let cur = inner.resources.get_mut(key).ok_or_else(|| StateError::NotFound(key.clone()))?;
        if cur.metadata.phase == Phase::TearingDown {
            return Ok(cur.metadata.finalizers.is_empty());
        }
        let old = cur.clone();
        cur.metadata.phase = Phase::TearingDown;
        cur.metadata.version = cur.metadata.version.next();
        cur.metadata.updated = Some(Utc::now());
        let new = cur.clone();
        let ready = new.metadata.finalizers.is_empty();
        self.publish(&mut inner, WatchEvent::Updated { old, new: new.clone() });
        drop(inner);
        metrics::counter!("state_ops_total", 1, "op" => "teardown");
        debug!(key = %key, version = %new.metadata.version, ready, "state: torn down");
        Ok(ready)
    }

    async fn destroy(&self, key: &ResourceKey) -> StateResult<()> {
        let mut inner = self.lock();
        let cur = inner.resources.get(key).ok_or_else(|| StateError::NotFound(key.clone()))?;
        if !cur.metadata.finalizers.is_empty() {
            return Err(StateError::PendingFinalizers { key: key.clone(), finalizers: cur.metadata.finalizers.clone() });
        }
        let Some(gone) = inner.resources.remove(key) else {
            return Err(StateError::NotFound(key.clone()));
        };
        self.publish(&mut inner, WatchEvent::Destroyed(gone));
        drop(inner);
        metrics::counter!("state_ops_total", 1, "op" => "destroy");
        debug!(key = %key, "state: destroyed");
        Ok(())
    }

    async fn add_finalizers(&self, key: &ResourceKey, finalizers: &[String]) -> StateResult<()> {
        let mut inner = self.lock();
        let cur = inner.resources.get_mut(key).ok_or_else(|| StateError::NotFound(key.clone()))?;
        if finalizers.iter().all(|f| cur.metadata.finalizers.contains(f)) {
            return Ok(());
        }
        let old = cur.clone();
        cur.metadata.finalizers.extend(finalizers.iter().cloned());
        cur.metadata.version = cur.metadata.version.next();
        cur.metadata.updated = Some(Utc::now());
        let new = cur.clone();
        self.publish(&mut inner, WatchEvent::Updated { old, new });
        metrics::counter!("state_ops_total", 1, "op" => "add_finalizers");
        Ok(())
    }

    async fn remove_finalizers(&self, key: &ResourceKey, finalizers: &[String]) -> StateResult<()> {
        let mut inner = self.lock();
        let cur = inner.resources.get_mut(key).ok_or_else(|| StateError::NotFound(key.clone()))?;
        if !finalizers.iter().any(|f| cur.metadata.finalizers.contains(f)) {
            return Ok(());
        }
        let old = cur.clone();
        for f in finalizers { cur.metadata.finalizers.remove(f); }
        cur.metadata.version = cur.metadata.version.next();
        cur.metadata.updated = Some(Utc::now());
        let new = cur.clone();
        self.publish(&mut inner, WatchEvent::Updated { old, new });
        metrics::counter!("state_ops_total", 1, "op" => "remove_finalizers");
        Ok(())
    }

    async fn watch(
        &self,
        kind: &Kind,
        opts: WatchOptions,
        sink: mpsc::Sender<WatchEvent>,
        cancel: CancellationToken,
    ) -> StateResult<()> {
        let filter = Filter { kind: kind.clone(), id: opts.id.clone(), queries: opts.label_queries };

        // Subscribe and capture the initial batch under one lock: nothing is lost or doubled.
        let (initial, mut rx) = {
            let inner = self.lock();
            let rx = self.tx.subscribe();
            let initial: Vec<WatchEvent> = if opts.tail_events > 0 {
                let mut tail: Vec<WatchEvent> = inner
                    .history
                    .iter()
                    .rev()
                    .filter_map(|ev| filter.project(ev))
                    .take(opts.tail_events)
                    .collect();
                tail.reverse();
                tail
            } else if let Some(id) = &opts.id {
                let key = ResourceKey::new(kind.namespace.clone(), kind.resource_type.clone(), id.clone());
                match inner.resources.get(&key) {
                    Some(r) if filter.matches_resource(r) => vec![WatchEvent::Created(r.clone())],
                    Some(_) => Vec::new(),
                    None => vec![WatchEvent::Destroyed(tombstone(&key))],
                }
            } else {
                let mut out: Vec<WatchEvent> = inner
                    .resources
                    .values()
                    .filter(|r| filter.matches_resource(r))
                    .map(|r| WatchEvent::Created(r.clone()))
                    .collect();
                out.push(WatchEvent::Bootstrapped);
                out
            };
            (initial, rx)
        };

        debug!(kind = %kind, id = ?filter.id, tail = opts.tail_events, initial = initial.len(), "state: watch registered");
        metrics::counter!("state_ops_total", 1, "op" => "watch");

        tokio::spawn(async move {
            for ev in initial {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = sink.send(ev) => if sent.is_err() { return; },
                }
            }
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    recv = rx.recv() => match recv {
                        Ok(ev) => {
                            let Some(ev) = filter.project(&ev) else { continue };
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                sent = sink.send(ev) => if sent.is_err() { break; },
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(kind = %filter.kind, skipped = n, "state: watcher fell behind, closing stream");
                            let _ = sink.send(WatchEvent::Errored(format!("watch lagged behind by {} events", n))).await;
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!(kind = %filter.kind, "state: watch ended");
        });
        Ok(())
    }
}
