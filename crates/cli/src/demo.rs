use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use corral_api::{CoreRuntime, QueryOptions, Runtime, RuntimeConfig};
use corral_controller::{Context, QueueController, Registry, WorkKey};
use corral_core::{Kind, Resource, ResourceMetadata, WatchEvent};
use corral_store::{watch_for, State, WatchOptions};
use corral_supervisor::Supervisor;
use corral_validated::LabelKeyRule;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Output;

pub const BACKUP_FINALIZER: &str = "corral.dev/backup";

/// Holds a finalizer on every cluster until the cluster is torn down.
pub struct BackupController;

#[async_trait]
impl QueueController for BackupController {
    fn name(&self) -> &str { "BackupController" }

    fn inputs(&self) -> Vec<Kind> { vec![Kind::new("default", "Cluster")] }

    async fn reconcile(&self, ctx: &Context, key: &WorkKey) -> Result<()> {
        let res = match ctx.get(key).await {
            Ok(r) => r,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let fin = [BACKUP_FINALIZER.to_string()];
        if res.metadata.is_torn_down() {
            info!(key = %key, "backup: taken, releasing finalizer");
            ctx.remove_finalizers(key, &fin).await?;
        } else {
            ctx.add_finalizers(key, &fin).await?;
        }
        Ok(())
    }
}

pub fn describe(ev: &WatchEvent) -> String {
    match ev.resource() {
        Some(r) => {
            let md = &r.metadata;
            let fins: Vec<&str> = md.finalizers.iter().map(String::as_str).collect();
            format!("{:<10} {} v{} {} [{}]", ev.kind_str(), md.key(), md.version, md.phase, fins.join(","))
        }
        None => ev.kind_str().to_string(),
    }
}

/// Walk `default/Cluster/<id>` through create, finalizer hold, delete and destroy.
pub async fn run(output: Output, id: &str) -> Result<()> {
    let registry = Registry::builder().queue_controller(BackupController).build()?;
    let rt = Arc::new(CoreRuntime::builder(RuntimeConfig::default()).rule(LabelKeyRule).registry(registry).build());
    let cancel = CancellationToken::new();
    let mut sup = Supervisor::new(cancel.clone());
    rt.run(&mut sup);

    let query = QueryOptions::new("default", "Cluster").name(id);
    let key = query.key()?;
    let t0 = Instant::now();
    let res = Resource::new(ResourceMetadata::new("default", "Cluster", id), serde_json::json!({ "replicas": 3 }))
        .with_label("env", "demo");
    rt.create(res).await.context("creating cluster")?;

    let state = rt.state();
    let (tx, mut rx) = mpsc::channel(64);
    let opts = WatchOptions { id: Some(key.id.clone()), ..Default::default() };
    state.watch(&query.kind(), opts, tx, cancel.child_token()).await.context("watching cluster")?;
    let printer = tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            match output {
                Output::Human => println!("{}", describe(&ev)),
                Output::Json => match serde_json::to_string(&ev) {
                    Ok(line) => println!("{}", line),
                    Err(e) => eprintln!("encode error: {}", e),
                },
            }
            if matches!(ev, WatchEvent::Destroyed(_)) { break; }
        }
    });

    watch_for(&*state, &key, &cancel, |ev| {
        ev.resource().map(|r| r.metadata.finalizers.contains(BACKUP_FINALIZER)).unwrap_or(false)
    })
    .await
    .context("waiting for the backup finalizer")?;

    rt.delete(&query, &cancel).await.context("deleting cluster")?;
    info!(id, took_ms = %t0.elapsed().as_millis(), "demo: cluster deleted");

    printer.await.context("event printer")?;
    cancel.cancel();
    sup.wait().await?;
    Ok(())
}
