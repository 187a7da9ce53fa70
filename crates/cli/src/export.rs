use std::sync::Arc;
use std::time::Duration;

use corral_controller::ExposesCounters;
use corral_controller::Counter;
use metrics::{describe_gauge, gauge, Unit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Periodically mirrors controller counters into `corral_runtime_*` gauges.
pub struct MetricsExport {
    sources: Vec<Arc<dyn ExposesCounters>>,
    interval: Duration,
}

impl MetricsExport {
    pub fn new(sources: Vec<Arc<dyn ExposesCounters>>, interval: Duration) -> Self { Self { sources, interval } }

    /// Register a description for every gauge this export will set.
    fn describe(&self) {
        for src in &self.sources {
            for c in src.counters() {
                match unit(&c) {
                    // Same expansion as `describe_gauge!`, which only accepts a literal `Unit::` path.
                    Some(u) => {
                        if let Some(recorder) = metrics::try_recorder() {
                            recorder.describe_gauge(gauge_name(&c).into(), Some(u), c.description.into());
                        }
                    }
                    None => describe_gauge!(gauge_name(&c), c.description),
                }
            }
        }
    }

    fn publish(&self) {
        let mut n = 0usize;
        for src in &self.sources {
            let owner = src.owner().to_string();
            for c in src.counters() {
                gauge!(gauge_name(&c), c.value, "controller" => owner.clone());
                n += 1;
            }
        }
        debug!(gauges = n, "metrics export: published");
    }

    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        info!(sources = self.sources.len(), interval_ms = %self.interval.as_millis(), "metrics export: started");
        self.describe();
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => self.publish(),
            }
        }
        self.publish();
        info!("metrics export: stopped");
        Ok(())
    }
}

fn gauge_name(c: &Counter) -> String { format!("corral_runtime_{}", c.name) }

fn unit(c: &Counter) -> Option<Unit> { c.name.ends_with("_seconds").then_some(Unit::Seconds) }

#[cfg(test)]
mod tests {
    use super::*;
    use corral_controller::{ControllerCounters, QueueCounters};

    #[test]
    fn busy_gauges_carry_seconds() {
        let c = ControllerCounters::new("ClusterStatusController");
        c.add_busy(Duration::from_millis(500));
        let q = QueueCounters::new("MachineSetController");
        let mut all = c.counters();
        all.extend(q.counters());

        let busy: Vec<_> = all.iter().filter(|c| unit(c) == Some(Unit::Seconds)).map(gauge_name).collect();
        assert_eq!(
            busy,
            vec![
                "corral_runtime_reconcile_busy_seconds",
                "corral_runtime_qcontroller_map_busy_seconds",
                "corral_runtime_qcontroller_reconcile_busy_seconds",
            ]
        );
        let reconcile = all.iter().find(|c| c.name == "reconcile_busy_seconds").unwrap();
        assert_eq!(reconcile.value, 0.5);
        assert!(all.iter().filter(|c| !c.name.contains("busy")).all(|c| unit(c).is_none()));
    }
}
