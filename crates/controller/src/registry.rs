use std::collections::BTreeSet;
use std::sync::Arc;

use crate::{Controller, ControllerCounters, ExposesCounters, QueueController, QueueCounters};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate controller: {0}")]
    DuplicateController(String),
}

pub(crate) struct RegisteredController {
    pub ctrl: Arc<dyn Controller>,
    pub counters: Arc<ControllerCounters>,
}

pub(crate) struct RegisteredQueue {
    pub ctrl: Arc<dyn QueueController>,
    pub counters: Arc<QueueCounters>,
}

enum Unit {
    Controller(Arc<dyn Controller>),
    Queue(Arc<dyn QueueController>),
}

impl Unit {
    fn name(&self) -> &str {
        match self {
            Unit::Controller(c) => c.name(),
            Unit::Queue(q) => q.name(),
        }
    }
}

/// Collects controllers in registration order; `build` freezes them.
#[derive(Default)]
pub struct RegistryBuilder {
    units: Vec<Unit>,
}

impl RegistryBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn controller(mut self, c: impl Controller + 'static) -> Self {
        self.units.push(Unit::Controller(Arc::new(c)));
        self
    }

    pub fn queue_controller(mut self, q: impl QueueController + 'static) -> Self {
        self.units.push(Unit::Queue(Arc::new(q)));
        self
    }

    /// Register `c` only when `cond` holds (feature-gated controllers).
    pub fn controller_if(self, cond: bool, c: impl Controller + 'static) -> Self {
        if cond { self.controller(c) } else { self }
    }

    pub fn queue_controller_if(self, cond: bool, q: impl QueueController + 'static) -> Self {
        if cond { self.queue_controller(q) } else { self }
    }

    pub fn build(self) -> Result<Registry, RegistryError> {
        let mut seen = BTreeSet::new();
        let mut controllers = Vec::new();
        let mut queues = Vec::new();
        for unit in self.units {
            if !seen.insert(unit.name().to_string()) {
                return Err(RegistryError::DuplicateController(unit.name().to_string()));
            }
            match unit {
                Unit::Controller(ctrl) => {
                    let counters = Arc::new(ControllerCounters::new(ctrl.name()));
                    controllers.push(RegisteredController { ctrl, counters });
                }
                Unit::Queue(ctrl) => {
                    let counters = Arc::new(QueueCounters::new(ctrl.name()));
                    queues.push(RegisteredQueue { ctrl, counters });
                }
            }
        }
        Ok(Registry { controllers, queues })
    }
}

/// Frozen set of controllers.
pub struct Registry {
    pub(crate) controllers: Vec<RegisteredController>,
    pub(crate) queues: Vec<RegisteredQueue>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder { RegistryBuilder::new() }

    pub fn empty() -> Self { Self { controllers: Vec::new(), queues: Vec::new() } }

    pub fn len(&self) -> usize { self.controllers.len() + self.queues.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn names(&self) -> Vec<&str> {
        self.controllers.iter().map(|c| c.ctrl.name()).chain(self.queues.iter().map(|q| q.ctrl.name())).collect()
    }

    pub fn controller_counters(&self, name: &str) -> Option<Arc<ControllerCounters>> {
        self.controllers.iter().find(|c| c.ctrl.name() == name).map(|c| Arc::clone(&c.counters))
    }

    pub fn queue_counters(&self, name: &str) -> Option<Arc<QueueCounters>> {
        self.queues.iter().find(|q| q.ctrl.name() == name).map(|q| Arc::clone(&q.counters))
    }

    /// Every counter source: engine counters per unit, then any unit-provided extras.
    pub fn counters(&self) -> Vec<Arc<dyn ExposesCounters>> {
        let mut out: Vec<Arc<dyn ExposesCounters>> = Vec::new();
        for c in &self.controllers {
            out.push(c.counters.clone());
            out.extend(c.ctrl.counters());
        }
        for q in &self.queues {
            out.push(q.counters.clone());
            out.extend(q.ctrl.counters());
        }
        out
    }
}
