use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// One exported counter value. Durations are reported in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Counter {
    pub name: &'static str,
    pub description: &'static str,
    pub value: f64,
}

impl Counter {
    fn count(name: &'static str, description: &'static str, value: u64) -> Self {
        Self { name, description, value: value as f64 }
    }

    fn seconds(name: &'static str, description: &'static str, micros: u64) -> Self {
        Self { name, description, value: micros as f64 / 1_000_000.0 }
    }
}

/// Anything that can report a fixed set of counters for one owner.
pub trait ExposesCounters: Send + Sync {
    fn owner(&self) -> &str;
    fn counters(&self) -> Vec<Counter>;
}

fn inc(c: &AtomicU64) { c.fetch_add(1, Ordering::Relaxed); }

fn load(c: &AtomicU64) -> u64 { c.load(Ordering::Relaxed) }

fn micros(d: Duration) -> u64 { u64::try_from(d.as_micros()).unwrap_or(u64::MAX) }

#[derive(Debug, Default)]
pub struct ControllerCounters {
    name: String,
    crashes: AtomicU64,
    wakeups: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    busy_us: AtomicU64,
    cycles: AtomicU64,
    input_items: AtomicU64,
}

impl ControllerCounters {
    pub fn new(name: impl Into<String>) -> Self { Self { name: name.into(), ..Default::default() } }

    pub fn inc_crashes(&self) { inc(&self.crashes) }
    pub fn inc_wakeups(&self) { inc(&self.wakeups) }
    pub fn inc_reads(&self) { inc(&self.reads) }
    pub fn inc_writes(&self) { inc(&self.writes) }
    pub fn inc_cycles(&self) { inc(&self.cycles) }
    pub fn add_input_items(&self, n: u64) { self.input_items.fetch_add(n, Ordering::Relaxed); }
    pub fn add_busy(&self, d: Duration) { self.busy_us.fetch_add(micros(d), Ordering::Relaxed); }

    pub fn crashes(&self) -> u64 { load(&self.crashes) }
    pub fn wakeups(&self) -> u64 { load(&self.wakeups) }
    pub fn reads(&self) -> u64 { load(&self.reads) }
    pub fn writes(&self) -> u64 { load(&self.writes) }
    pub fn cycles(&self) -> u64 { load(&self.cycles) }
    pub fn input_items(&self) -> u64 { load(&self.input_items) }
}

impl ExposesCounters for ControllerCounters {
    fn owner(&self) -> &str { &self.name }

    fn counters(&self) -> Vec<Counter> {
        vec![
            Counter::count("controller_crashes", "controller crashes", self.crashes()),
            Counter::count("controller_wakeups", "controller wakeups", self.wakeups()),
            Counter::count("controller_reads", "controller reads", self.reads()),
            Counter::count("controller_writes", "controller writes", self.writes()),
            Counter::seconds("reconcile_busy_seconds", "time spent reconciling", load(&self.busy_us)),
            Counter::count("reconcile_cycles", "reconcile cycles", self.cycles()),
            Counter::count("reconcile_input_items", "input events consumed", self.input_items()),
        ]
    }
}

#[derive(Debug, Default)]
pub struct QueueCounters {
    name: String,
    crashes: AtomicU64,
    requeues: AtomicU64,
    processed: AtomicU64,
    mapped_in: AtomicU64,
    mapped_out: AtomicU64,
    queue_length: AtomicU64,
    map_busy_us: AtomicU64,
    reconcile_busy_us: AtomicU64,
}

impl QueueCounters {
    pub fn new(name: impl Into<String>) -> Self { Self { name: name.into(), ..Default::default() } }

    pub fn inc_crashes(&self) { inc(&self.crashes) }
    pub fn inc_requeues(&self) { inc(&self.requeues) }
    pub fn inc_processed(&self) { inc(&self.processed) }
    pub fn inc_mapped_in(&self) { inc(&self.mapped_in) }
    pub fn add_mapped_out(&self, n: u64) { self.mapped_out.fetch_add(n, Ordering::Relaxed); }
    pub fn set_queue_length(&self, n: usize) { self.queue_length.store(n as u64, Ordering::Relaxed); }
    pub fn add_map_busy(&self, d: Duration) { self.map_busy_us.fetch_add(micros(d), Ordering::Relaxed); }
    pub fn add_reconcile_busy(&self, d: Duration) { self.reconcile_busy_us.fetch_add(micros(d), Ordering::Relaxed); }

    pub fn crashes(&self) -> u64 { load(&self.crashes) }
    pub fn requeues(&self) -> u64 { load(&self.requeues) }
    pub fn processed(&self) -> u64 { load(&self.processed) }
    pub fn mapped_in(&self) -> u64 { load(&self.mapped_in) }
    pub fn mapped_out(&self) -> u64 { load(&self.mapped_out) }
    pub fn queue_length(&self) -> u64 { load(&self.queue_length) }
}

impl ExposesCounters for QueueCounters {
    fn owner(&self) -> &str { &self.name }

    fn counters(&self) -> Vec<Counter> {
        vec![
            Counter::count("qcontroller_crashes", "queue controller crashes", self.crashes()),
            Counter::count("qcontroller_requeues", "keys requeued after failure", self.requeues()),
            Counter::count("qcontroller_processed", "keys reconciled", self.processed()),
            Counter::count("qcontroller_mapped_in", "input events mapped", self.mapped_in()),
            Counter::count("qcontroller_mapped_out", "keys produced by mapping", self.mapped_out()),
            Counter::count("qcontroller_queue_length", "pending keys", self.queue_length()),
            Counter::seconds("qcontroller_map_busy_seconds", "time spent mapping", load(&self.map_busy_us)),
            Counter::seconds("qcontroller_reconcile_busy_seconds", "time spent reconciling", load(&self.reconcile_busy_us)),
        ]
    }
}
