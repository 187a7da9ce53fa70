use std::net::SocketAddr;
use std::time::Duration;

use corral_core::Kind;
use corral_store::MemoryConfig;
use tracing::warn;

/// Runtime knobs, read from `CORRAL_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Past store events kept for tail replay.
    pub watch_history: usize,
    /// Live events a watcher may lag behind before its stream is errored.
    pub watch_buffer: usize,
    /// Upper bound on each queue controller's pending keys.
    pub queue_cap: usize,
    pub resource_logger: bool,
    /// `namespace/type` or bare `type` (namespace `default`).
    pub resource_logger_types: Vec<String>,
    pub metrics_addr: Option<SocketAddr>,
    pub metrics_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            watch_history: 1024,
            watch_buffer: 1024,
            queue_cap: 4096,
            resource_logger: false,
            resource_logger_types: Vec::new(),
            metrics_addr: None,
            metrics_interval: Duration::from_secs(10),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "config: ignoring unparsable value");
            None
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            watch_history: env_parse("CORRAL_WATCH_HISTORY").unwrap_or(d.watch_history),
            watch_buffer: env_parse("CORRAL_WATCH_BUFFER").unwrap_or(d.watch_buffer),
            queue_cap: env_parse("CORRAL_QUEUE_CAP").unwrap_or(d.queue_cap),
            resource_logger: env_flag("CORRAL_RESOURCE_LOGGER").unwrap_or(d.resource_logger),
            resource_logger_types: std::env::var("CORRAL_RESOURCE_LOGGER_TYPES")
                .map(|s| split_list(&s))
                .unwrap_or(d.resource_logger_types),
            metrics_addr: env_parse("CORRAL_METRICS_ADDR").or(d.metrics_addr),
            metrics_interval: env_parse::<u64>("CORRAL_METRICS_INTERVAL_MS").map(Duration::from_millis).unwrap_or(d.metrics_interval),
        }
    }

    pub fn memory(&self) -> MemoryConfig { MemoryConfig { history: self.watch_history, buffer: self.watch_buffer } }

    /// Kinds the resource logger follows; empty when it is disabled.
    pub fn logged_kinds(&self) -> Vec<Kind> {
        if !self.resource_logger { return Vec::new(); }
        self.resource_logger_types
            .iter()
            .map(|t| match t.split_once('/') {
                Some((ns, ty)) => Kind::new(ns, ty),
                None => Kind::new("default", t.as_str()),
            })
            .collect()
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logged_kinds_follow_flag() {
        let mut cfg = RuntimeConfig { resource_logger_types: split_list("Cluster, infra/Machine,,"), ..Default::default() };
        assert!(cfg.logged_kinds().is_empty());
        cfg.resource_logger = true;
        assert_eq!(cfg.logged_kinds(), vec![Kind::new("default", "Cluster"), Kind::new("infra", "Machine")]);
        assert_eq!(cfg.memory().history, 1024);
    }
}
