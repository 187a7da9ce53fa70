//! Default reconciliation engine.
//!
//! Every `Controller` runs in its own task, woken by watch events on its
//! inputs; events that pile up while it reconciles are folded into one
//! wakeup. A failed or panicking reconcile counts as a crash and is retried
//! after an exponential backoff. Every `QueueController` gets a mapper task
//! feeding a coalescing work queue and `concurrency` workers draining it.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use corral_core::WatchEvent;
use corral_store::{State, WatchOptions};
use futures::FutureExt;
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::WorkQueue;
use crate::registry::{RegisteredController, RegisteredQueue};
use crate::{Context, Registry, WorkKey};

const CRASH_BACKOFF_BASE: Duration = Duration::from_millis(100);
const CRASH_BACKOFF_MAX: Duration = Duration::from_secs(30);
const INPUT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

fn panic_message(p: Box<dyn Any + Send>) -> String {
    p.downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| p.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Await `fut`, turning a panic into an error.
async fn guarded<F>(fut: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(res) => res,
        Err(p) => Err(anyhow!("panic: {}", panic_message(p))),
    }
}

async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

pub struct Engine {
    registry: Arc<Registry>,
    state: Arc<dyn State>,
    queue_cap: Option<usize>,
}

impl Engine {
    pub fn new(registry: Arc<Registry>, state: Arc<dyn State>) -> Self { Self { registry, state, queue_cap: None } }

    /// Upper bound on every queue controller's pending keys.
    pub fn with_queue_capacity(mut self, cap: usize) -> Self {
        self.queue_cap = Some(cap);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> { &self.registry }

    /// Drive all registered controllers until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        info!(
            controllers = self.registry.controllers.len(),
            queue_controllers = self.registry.queues.len(),
            "engine: starting"
        );
        let mut tasks = JoinSet::new();
        for idx in 0..self.registry.controllers.len() {
            let registry = Arc::clone(&self.registry);
            let state = Arc::clone(&self.state);
            let cancel = cancel.clone();
            tasks.spawn(async move { run_controller(&registry.controllers[idx], state, cancel).await });
        }
        for idx in 0..self.registry.queues.len() {
            let registry = Arc::clone(&self.registry);
            let state = Arc::clone(&self.state);
            let cancel = cancel.clone();
            let cap = self.queue_cap;
            tasks.spawn(async move { run_queue(&registry.queues[idx], state, cap, cancel).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    cancel.cancel();
                    return Err(anyhow!("engine task panicked: {}", e));
                }
            }
        }
        info!("engine: stopped");
        Ok(())
    }
}

/// Subscribe `tx` to every input kind under `scope`.
async fn subscribe(state: &Arc<dyn State>, inputs: &[corral_core::Kind], tx: &mpsc::Sender<WatchEvent>, scope: &CancellationToken) -> anyhow::Result<()> {
    for kind in inputs {
        state.watch(kind, WatchOptions::default(), tx.clone(), scope.clone()).await?;
    }
    Ok(())
}

async fn run_controller(unit: &RegisteredController, state: Arc<dyn State>, cancel: CancellationToken) {
    let name = unit.ctrl.name();
    let counters = &unit.counters;
    let inputs = unit.ctrl.inputs();
    let ctx = Context::new(Arc::clone(&state), cancel.clone()).with_counters(Arc::clone(counters));
    let backoff = Backoff { base: CRASH_BACKOFF_BASE, max: CRASH_BACKOFF_MAX };
    let mut failures: u32 = 0;
    let mut settled = false;
    debug!(controller = name, inputs = inputs.len(), "engine: controller started");

    'subscribe: while !cancel.is_cancelled() {
        let scope = cancel.child_token();
        let (tx, mut rx) = mpsc::channel(INPUT_BUFFER);
        if let Err(e) = subscribe(&state, &inputs, &tx, &scope).await {
            scope.cancel();
            counters.inc_crashes();
            warn!(controller = name, error = %e, "engine: input watch failed");
            if !sleep_or_cancel(backoff.delay(failures), &cancel).await { break; }
            failures = failures.saturating_add(1);
            continue;
        }
        drop(tx);
        let mut retry = false;

        loop {
            if !retry && inputs.is_empty() {
                // Nothing to watch: reconcile once, then idle.
                if settled {
                    cancel.cancelled().await;
                    break 'subscribe;
                }
            } else if !retry {
                let first = tokio::select! {
                    _ = cancel.cancelled() => break 'subscribe,
                    ev = rx.recv() => ev,
                };
                let mut items: u64 = 0;
                let mut lost = false;
                let mut next = first;
                while let Some(ev) = next {
                    if matches!(ev, WatchEvent::Errored(_)) { lost = true; }
                    items += 1;
                    next = rx.try_recv().ok();
                }
                if items == 0 || lost {
                    // Stream ended or fell behind: resubscribe and reconcile from scratch.
                    scope.cancel();
                    warn!(controller = name, "engine: input watch lost, resubscribing");
                    continue 'subscribe;
                }
                counters.inc_wakeups();
                counters.add_input_items(items);
            }

            let started = Instant::now();
            let res = guarded(unit.ctrl.reconcile(&ctx)).await;
            counters.add_busy(started.elapsed());
            counters.inc_cycles();
            histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1000.0, "controller" => name.to_string());
            match res {
                Ok(()) => {
                    failures = 0;
                    retry = false;
                    settled = true;
                }
                Err(e) => {
                    counters.inc_crashes();
                    counter!("controller_crashes_total", 1, "controller" => name.to_string());
                    let delay = backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    let reason = format!("{:#}", e);
                    warn!(controller = name, error = %reason, retry_in_ms = delay.as_millis() as u64, "engine: controller crashed");
                    if !sleep_or_cancel(delay, &cancel).await { break 'subscribe; }
                    retry = true;
                }
            }
        }
    }
    debug!(controller = name, "engine: controller stopped");
}

async fn run_queue(unit: &RegisteredQueue, state: Arc<dyn State>, cap: Option<usize>, cancel: CancellationToken) {
    let name = unit.ctrl.name();
    let mut settings = unit.ctrl.settings();
    if let Some(cap) = cap { settings.capacity = settings.capacity.min(cap); }
    let queue: Arc<WorkQueue<WorkKey>> = Arc::new(WorkQueue::new(settings.capacity));
    let ctx = Context::new(Arc::clone(&state), cancel.clone());
    debug!(controller = name, concurrency = settings.concurrency, capacity = settings.capacity, "engine: queue controller started");

    let workers = (0..settings.concurrency.max(1)).map(|worker| {
        let queue = Arc::clone(&queue);
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        async move {
            let requeue = Backoff { base: settings.requeue_base, max: settings.requeue_max };
            while let Some((key, attempt)) = queue.next(&cancel).await {
                unit.counters.set_queue_length(queue.len());
                let started = Instant::now();
                let res = guarded(unit.ctrl.reconcile(&ctx, &key)).await;
                unit.counters.add_reconcile_busy(started.elapsed());
                unit.counters.inc_processed();
                histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1000.0, "controller" => name.to_string());
                queue.done(&key);
                if let Err(e) = res {
                    unit.counters.inc_requeues();
                    let delay = requeue.delay(attempt);
                    let reason = format!("{:#}", e);
                    debug!(controller = name, worker, key = %key, attempt, error = %reason, "engine: requeue");
                    let queue = Arc::clone(&queue);
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if sleep_or_cancel(delay, &cancel).await { queue.push(key, attempt.saturating_add(1)); }
                    });
                }
            }
        }
    });
    let workers = futures::future::join_all(workers);
    let mapper = map_inputs(unit, &ctx, &state, &queue, &cancel);
    tokio::join!(workers, mapper);
    debug!(controller = name, dropped = queue.dropped(), "engine: queue controller stopped");
}

async fn map_inputs(
    unit: &RegisteredQueue,
    ctx: &Context,
    state: &Arc<dyn State>,
    queue: &Arc<WorkQueue<WorkKey>>,
    cancel: &CancellationToken,
) {
    let name = unit.ctrl.name();
    let inputs = unit.ctrl.inputs();
    let backoff = Backoff { base: CRASH_BACKOFF_BASE, max: CRASH_BACKOFF_MAX };
    let mut failures: u32 = 0;

    'subscribe: while !cancel.is_cancelled() {
        let scope = cancel.child_token();
        let (tx, mut rx) = mpsc::channel(INPUT_BUFFER);
        if let Err(e) = subscribe(state, &inputs, &tx, &scope).await {
            scope.cancel();
            unit.counters.inc_crashes();
            warn!(controller = name, error = %e, "engine: input watch failed");
            if !sleep_or_cancel(backoff.delay(failures), cancel).await { break; }
            failures = failures.saturating_add(1);
            continue;
        }
        drop(tx);

        loop {
            let ev = tokio::select! {
                _ = cancel.cancelled() => break 'subscribe,
                ev = rx.recv() => ev,
            };
            let ev = match ev {
                Some(WatchEvent::Bootstrapped) => continue,
                Some(WatchEvent::Errored(msg)) => {
                    scope.cancel();
                    warn!(controller = name, %msg, "engine: input watch lost, resubscribing");
                    continue 'subscribe;
                }
                Some(ev) => ev,
                None => {
                    scope.cancel();
                    continue 'subscribe;
                }
            };
            unit.counters.inc_mapped_in();
            let started = Instant::now();
            let mapped = guarded_map(unit, ctx, &ev).await;
            unit.counters.add_map_busy(started.elapsed());
            match mapped {
                Ok(keys) => {
                    failures = 0;
                    unit.counters.add_mapped_out(keys.len() as u64);
                    for key in keys {
                        let len = queue.push(key, 0);
                        unit.counters.set_queue_length(len);
                    }
                }
                Err(e) => {
                    unit.counters.inc_crashes();
                    let delay = backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    let reason = format!("{:#}", e);
                    warn!(controller = name, error = %reason, "engine: map_input crashed");
                    if !sleep_or_cancel(delay, cancel).await { break 'subscribe; }
                }
            }
        }
    }
}

async fn guarded_map(unit: &RegisteredQueue, ctx: &Context, ev: &WatchEvent) -> anyhow::Result<Vec<WorkKey>> {
    match AssertUnwindSafe(unit.ctrl.map_input(ctx, ev)).catch_unwind().await {
        Ok(res) => res,
        Err(p) => Err(anyhow!("panic: {}", panic_message(p))),
    }
}
