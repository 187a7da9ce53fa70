use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use corral_controller::{Engine, ExposesCounters, Registry};
use corral_core::fields::{FieldRegistry, ListItem};
use corral_core::{Resource, StateError, StateResult, WatchEvent};
use corral_search::parse_selectors;
use corral_store::{finalizers_empty, watch_for, ListOptions, MemoryState, State, UpdateOptions, WatchOptions};
use corral_supervisor::Supervisor;
use corral_validated::{ValidatedState, ValidationRule};
use metrics::histogram;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{QueryOptions, ResourceItem, ResourceLogger, RuntimeConfig};

/// Result of a list query.
#[derive(Debug, Default)]
pub struct ListResult {
    pub items: Vec<Box<dyn ListItem>>,
    pub total: usize,
}

/// Query surface consumed by front-ends.
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn get(&self, opts: &QueryOptions) -> StateResult<Resource>;

    async fn list(&self, opts: &QueryOptions) -> StateResult<ListResult>;

    /// Stream events for the query into `sink` until `cancel` fires, the
    /// receiver is dropped or the store ends the stream. A stream the store
    /// gave up on (`Errored`) is forwarded and then reported as `Unavailable`.
    async fn watch(&self, opts: &QueryOptions, sink: mpsc::Sender<WatchEvent>, cancel: CancellationToken) -> StateResult<()>;

    async fn create(&self, res: Resource) -> StateResult<Resource>;

    /// An `Undefined` version means "whatever is stored now": the current
    /// version is read first. Another writer landing in between wins.
    async fn update(&self, res: Resource) -> StateResult<Resource>;

    /// Tear the resource down and, unless `teardown_only`, wait for its
    /// finalizers to drain and destroy it. Deleting a missing resource succeeds.
    async fn delete(&self, opts: &QueryOptions, cancel: &CancellationToken) -> StateResult<()>;
}

/// Long-running collaborator started next to the engine (DNS, proxies, ...).
#[async_trait]
pub trait Subsystem: Send + Sync {
    async fn run(&self, state: Arc<dyn State>, cancel: CancellationToken) -> anyhow::Result<()>;
}

pub struct CoreRuntimeBuilder {
    config: RuntimeConfig,
    rules: Vec<Arc<dyn ValidationRule>>,
    registry: Option<Registry>,
    fields: FieldRegistry,
    subsystems: Vec<(String, Arc<dyn Subsystem>)>,
    virtual_state: Option<Arc<dyn Subsystem>>,
}

impl CoreRuntimeBuilder {
    pub fn rule(mut self, rule: impl ValidationRule + 'static) -> Self {
        self.rules.push(Arc::new(rule));
        self
    }

    pub fn rule_arc(mut self, rule: Arc<dyn ValidationRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn fields(mut self, fields: FieldRegistry) -> Self {
        self.fields = fields;
        self
    }

    /// Add a sibling subsystem supervised under `label`.
    pub fn subsystem(mut self, label: impl Into<String>, s: impl Subsystem + 'static) -> Self {
        self.subsystems.push((label.into(), Arc::new(s)));
        self
    }

    /// Producer of computed (virtual) resources; optional.
    pub fn virtual_state(mut self, s: Option<Arc<dyn Subsystem>>) -> Self {
        self.virtual_state = s;
        self
    }

    pub fn build(self) -> CoreRuntime {
        let validated = self
            .rules
            .into_iter()
            .fold(ValidatedState::builder(MemoryState::new(self.config.memory())), |b, r| b.rule_arc(r))
            .build();
        let registry = self.registry.unwrap_or_else(Registry::empty);
        CoreRuntime {
            state: Arc::new(validated),
            registry: Arc::new(registry),
            fields: self.fields,
            config: self.config,
            subsystems: self.subsystems,
            virtual_state: self.virtual_state,
        }
    }
}

/// `Runtime` over the in-memory store behind the validation wrapper.
pub struct CoreRuntime {
    state: Arc<ValidatedState<MemoryState>>,
    registry: Arc<Registry>,
    fields: FieldRegistry,
    config: RuntimeConfig,
    subsystems: Vec<(String, Arc<dyn Subsystem>)>,
    virtual_state: Option<Arc<dyn Subsystem>>,
}

impl CoreRuntime {
    pub fn builder(config: RuntimeConfig) -> CoreRuntimeBuilder {
        CoreRuntimeBuilder {
            config,
            rules: Vec::new(),
            registry: None,
            fields: FieldRegistry::default(),
            subsystems: Vec::new(),
            virtual_state: None,
        }
    }

    /// The validated store, for collaborators that need the full `State` surface.
    pub fn state(&self) -> Arc<dyn State> { self.state.clone() }

    pub fn config(&self) -> &RuntimeConfig { &self.config }

    pub fn counters(&self) -> Vec<Arc<dyn ExposesCounters>> { self.registry.counters() }

    /// Schedule the engine and every configured subsystem on `sup`.
    pub fn run(&self, sup: &mut Supervisor) {
        let state = self.state();

        let engine = Engine::new(Arc::clone(&self.registry), Arc::clone(&state)).with_queue_capacity(self.config.queue_cap);
        sup.spawn("controller runtime", move |cancel| engine.run(cancel));

        let kinds = self.config.logged_kinds();
        let logger = (!kinds.is_empty()).then(|| ResourceLogger::new(Arc::clone(&state), kinds));
        sup.spawn_opt("resource logger", logger, |logger, cancel| logger.run(cancel));

        for (label, s) in &self.subsystems {
            let s = Arc::clone(s);
            let state = Arc::clone(&state);
            sup.spawn(label.clone(), move |cancel| async move { s.run(state, cancel).await });
        }

        let st = Arc::clone(&state);
        sup.spawn_opt("virtual state", self.virtual_state.clone(), move |v, cancel| async move { v.run(st, cancel).await });
    }
}

#[async_trait]
impl Runtime for CoreRuntime {
    async fn get(&self, opts: &QueryOptions) -> StateResult<Resource> { self.state.get(&opts.key()?).await }

    async fn list(&self, opts: &QueryOptions) -> StateResult<ListResult> {
        let t0 = Instant::now();
        let label_queries = parse_selectors(&opts.label_selectors)?;
        let list_opts = ListOptions { label_queries, id: opts.name.clone() };
        let resources = self.state.list(&opts.kind(), &list_opts).await?;
        let adapter = self.fields.adapter_for(&opts.resource_type);
        let search = opts.search.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let items: Vec<Box<dyn ListItem>> = resources
            .into_iter()
            .map(|r| ResourceItem::new(r, Arc::clone(&adapter)))
            .filter(|item| search.map(|s| item.matches(s)).unwrap_or(true))
            .map(|item| Box::new(item) as Box<dyn ListItem>)
            .collect();
        let total = items.len();
        histogram!("runtime_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(kind = %opts.kind(), total, took_ms = %t0.elapsed().as_millis(), "runtime: list");
        Ok(ListResult { items, total })
    }

    async fn watch(&self, opts: &QueryOptions, sink: mpsc::Sender<WatchEvent>, cancel: CancellationToken) -> StateResult<()> {
        let label_queries = parse_selectors(&opts.label_selectors)?;
        let watch_opts = WatchOptions { id: opts.name.clone(), tail_events: opts.tail_events, label_queries };
        let scope = cancel.child_token();
        let _guard = scope.clone().drop_guard();
        let (tx, mut rx) = mpsc::channel(sink.max_capacity().max(1));
        self.state.watch(&opts.kind(), watch_opts, tx, scope).await?;
        let outcome = loop {
            let ev = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = sink.closed() => break Ok(()),
                ev = rx.recv() => ev,
            };
            let Some(ev) = ev else { break Ok(()) };
            let lost = match &ev {
                WatchEvent::Errored(msg) => Some(msg.clone()),
                _ => None,
            };
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                sent = sink.send(ev) => if sent.is_err() { break Ok(()); },
            }
            if let Some(msg) = lost {
                break Err(StateError::Unavailable(msg));
            }
        };
        debug!(kind = %opts.kind(), id = ?opts.name, ok = outcome.is_ok(), "runtime: watch ended");
        outcome
    }

    async fn create(&self, res: Resource) -> StateResult<Resource> { self.state.create(res).await }

    async fn update(&self, mut res: Resource) -> StateResult<Resource> {
        if res.metadata.version.is_undefined() {
            let current = self.state.get(&res.key()).await?;
            res.metadata.version = current.metadata.version;
        }
        self.state.update(res, UpdateOptions::default()).await
    }

    async fn delete(&self, opts: &QueryOptions, cancel: &CancellationToken) -> StateResult<()> {
        let key = opts.key()?;
        let t0 = Instant::now();
        match self.state.teardown(&key).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!(key = %key, "runtime: delete of missing resource");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        if opts.teardown_only {
            debug!(key = %key, "runtime: torn down");
            return Ok(());
        }
        watch_for(&*self.state, &key, cancel, finalizers_empty).await?;
        match self.state.destroy(&key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        histogram!("runtime_delete_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(key = %key, took_ms = %t0.elapsed().as_millis(), "runtime: destroyed");
        Ok(())
    }
}
