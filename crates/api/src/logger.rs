use std::sync::Arc;

use corral_core::{Kind, WatchEvent};
use corral_store::{State, WatchOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Logs every change to the configured resource kinds.
pub struct ResourceLogger {
    state: Arc<dyn State>,
    kinds: Vec<Kind>,
}

impl ResourceLogger {
    pub fn new(state: Arc<dyn State>, kinds: Vec<Kind>) -> Self { Self { state, kinds } }

    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::channel(256);
        for kind in &self.kinds {
            self.state.watch(kind, WatchOptions::default(), tx.clone(), cancel.clone()).await?;
        }
        drop(tx);
        info!(kinds = self.kinds.len(), "resource logger: started");
        loop {
            let ev = tokio::select! {
                _ = cancel.cancelled() => break,
                ev = rx.recv() => ev,
            };
            match ev {
                Some(WatchEvent::Bootstrapped) => {}
                Some(WatchEvent::Errored(msg)) => anyhow::bail!("watch failed: {}", msg),
                Some(ev) => {
                    if let Some(res) = ev.resource() {
                        let md = &res.metadata;
                        info!(
                            event = ev.kind_str(),
                            ns = %md.namespace,
                            resource_type = %md.resource_type,
                            id = %md.id,
                            version = %md.version,
                            phase = %md.phase,
                            "resource"
                        );
                    }
                }
                None => {
                    warn!("resource logger: watch closed");
                    break;
                }
            }
        }
        info!("resource logger: stopped");
        Ok(())
    }
}
