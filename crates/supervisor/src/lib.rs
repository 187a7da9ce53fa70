//! Corral supervisor: runs labelled subsystems under one cancellation scope
//! and fails fast when any of them fails.

#![forbid(unsafe_code)]

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("{label} failed: {source:#}")]
    SubsystemFailed { label: String, source: anyhow::Error },
}

impl SupervisorError {
    pub fn label(&self) -> &str {
        match self {
            SupervisorError::SubsystemFailed { label, .. } => label,
        }
    }
}

fn panic_message(p: Box<dyn Any + Send>) -> String {
    p.downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| p.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Group of subsystems sharing one `CancellationToken`.
///
/// The first subsystem to return an error (or panic) cancels the token; the
/// others are expected to observe it and return. Subsystems are never
/// restarted, and one returning `Ok(())` leaves its siblings running.
pub struct Supervisor {
    cancel: CancellationToken,
    tasks: JoinSet<(String, anyhow::Result<()>)>,
}

impl Supervisor {
    pub fn new(cancel: CancellationToken) -> Self { Self { cancel, tasks: JoinSet::new() } }

    pub fn token(&self) -> CancellationToken { self.cancel.clone() }

    pub fn len(&self) -> usize { self.tasks.len() }

    pub fn is_empty(&self) -> bool { self.tasks.is_empty() }

    /// Start a subsystem; `f` gets the shared token.
    pub fn spawn<F, Fut>(&mut self, label: impl Into<String>, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let label = label.into();
        let fut = f(self.cancel.clone());
        info!(subsystem = %label, "supervisor: starting");
        self.tasks.spawn(async move {
            let res = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(res) => res,
                Err(p) => Err(anyhow::anyhow!("panic: {}", panic_message(p))),
            };
            (label, res)
        });
    }

    /// Start a subsystem that needs `handle`; skipped when it is absent.
    pub fn spawn_opt<H, F, Fut>(&mut self, label: impl Into<String>, handle: Option<H>, f: F)
    where
        F: FnOnce(H, CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let label = label.into();
        match handle {
            Some(h) => self.spawn(label, move |cancel| f(h, cancel)),
            None => debug!(subsystem = %label, "supervisor: not configured, skipping"),
        }
    }

    /// Wait for every subsystem to finish. Returns the first failure, if any.
    pub async fn wait(mut self) -> Result<(), SupervisorError> {
        let mut first: Option<SupervisorError> = None;
        while let Some(joined) = self.tasks.join_next().await {
            let (label, res) = match joined {
                Ok(out) => out,
                // Only reachable if the task was aborted from outside.
                Err(e) => ("<unknown>".to_string(), Err(anyhow::anyhow!("task aborted: {}", e))),
            };
            match res {
                Ok(()) => info!(subsystem = %label, "supervisor: finished"),
                Err(source) => {
                    let reason = format!("{:#}", source);
                    if first.is_none() {
                        error!(subsystem = %label, error = %reason, "supervisor: subsystem failed, cancelling");
                        self.cancel.cancel();
                        first = Some(SupervisorError::SubsystemFailed { label, source });
                    } else {
                        debug!(subsystem = %label, error = %reason, "supervisor: subsystem failed after cancel");
                    }
                }
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
