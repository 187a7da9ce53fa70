use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use corral_api::{CoreRuntime, RuntimeConfig};
use corral_controller::Registry;
use corral_core::Labels;
use corral_supervisor::Supervisor;
use corral_validated::{LabelKeyRule, ValidationRule};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod demo;
mod export;

#[derive(Parser, Debug)]
#[command(name = "corralctl", version, about = "Corral control-plane runtime")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the runtime until Ctrl-C or a subsystem fails
    Serve {
        /// Bounded capacity of each queue controller
        #[arg(long = "queue-cap", env = "CORRAL_QUEUE_CAP")]
        queue_cap: Option<usize>,
        /// Prometheus listener, e.g. 127.0.0.1:9100
        #[arg(long = "metrics-addr", env = "CORRAL_METRICS_ADDR")]
        metrics_addr: Option<SocketAddr>,
        /// Log every change to these types (`ns/type` or `type`)
        #[arg(long = "log-resources", value_delimiter = ',')]
        log_resources: Vec<String>,
        /// Register the cluster backup controller
        #[arg(long = "backup", action = ArgAction::SetTrue)]
        backup: bool,
        /// JSON Schema for a type's spec, as TYPE=PATH (YAML or JSON)
        #[cfg(feature = "validate")]
        #[arg(long = "schema")]
        schemas: Vec<String>,
    },
    /// Parse label selectors and optionally test them against labels
    Selector {
        /// Selectors, e.g. "env=prod,tier in (web,api)"; all must hold
        #[arg(required = true)]
        selectors: Vec<String>,
        /// Labels to test, e.g. "env=prod,tier=web"
        #[arg(long = "labels")]
        labels: Option<String>,
    },
    /// Create a cluster, let a controller hold it with a finalizer, then delete it
    Demo {
        #[arg(long = "id", default_value = "c1")]
        id: String,
    },
}

fn init_tracing() {
    let env = std::env::var("CORRAL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics(addr: Option<SocketAddr>) -> bool {
    let Some(sock) = addr else { return false };
    match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
        Ok(()) => {
            info!(addr = %sock, "Prometheus metrics exporter listening");
            true
        }
        Err(e) => {
            warn!(error = %e, "failed to install metrics exporter");
            false
        }
    }
}

fn parse_labels(raw: &str) -> Result<Labels> {
    let mut labels = Labels::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once('=').with_context(|| format!("label {:?} is not key=value", pair))?;
        labels.set(k.trim(), v.trim());
    }
    Ok(labels)
}

async fn serve(mut config: RuntimeConfig, backup: bool, rules: Vec<Arc<dyn ValidationRule>>) -> Result<()> {
    let registry = Registry::builder().queue_controller_if(backup, demo::BackupController).build()?;
    let counters = registry.counters();
    if !config.resource_logger_types.is_empty() {
        config.resource_logger = true;
    }
    let exporting = init_metrics(config.metrics_addr);
    let interval = config.metrics_interval;

    let rt = rules
        .into_iter()
        .fold(CoreRuntime::builder(config).rule(LabelKeyRule), |b, r| b.rule_arc(r))
        .registry(registry)
        .build();

    let cancel = CancellationToken::new();
    let mut sup = Supervisor::new(cancel.clone());
    rt.run(&mut sup);
    let exporter = exporting.then(|| export::MetricsExport::new(counters, interval));
    sup.spawn_opt("metrics export", exporter, |e, cancel| e.run(cancel));
    sup.spawn("signal", |cancel| async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            res = signal::ctrl_c() => {
                res.context("listening for Ctrl-C")?;
                info!("Ctrl-C received; shutting down");
                cancel.cancel();
            }
        }
        anyhow::Ok(())
    });

    info!(controllers = rt.counters().len(), "runtime: serving");
    sup.wait().await.context("runtime stopped")?;
    info!("runtime: stopped");
    Ok(())
}

#[cfg(feature = "validate")]
fn schema_rules(specs: &[String]) -> Result<Vec<Arc<dyn ValidationRule>>> {
    let mut out: Vec<Arc<dyn ValidationRule>> = Vec::new();
    for spec in specs {
        let (ty, path) = spec.split_once('=').with_context(|| format!("schema {:?} is not TYPE=PATH", spec))?;
        let text = std::fs::read_to_string(path).with_context(|| format!("reading schema {}", path))?;
        let rule = corral_validated::SchemaRule::from_yaml(ty, &text)?;
        info!(resource_type = ty, path, "schema rule loaded");
        out.push(Arc::new(rule));
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            queue_cap,
            metrics_addr,
            log_resources,
            backup,
            #[cfg(feature = "validate")]
            schemas,
        } => {
            let mut config = RuntimeConfig::from_env();
            if let Some(cap) = queue_cap { config.queue_cap = cap; }
            config.metrics_addr = metrics_addr.or(config.metrics_addr);
            if !log_resources.is_empty() { config.resource_logger_types = log_resources; }
            if config.metrics_interval < Duration::from_millis(100) {
                warn!(interval_ms = %config.metrics_interval.as_millis(), "metrics interval too short; using 100ms");
                config.metrics_interval = Duration::from_millis(100);
            }
            #[cfg(feature = "validate")]
            let extra = schema_rules(&schemas)?;
            #[cfg(not(feature = "validate"))]
            let extra = Vec::new();
            serve(config, backup, extra).await?;
        }
        Commands::Selector { selectors, labels } => {
            let queries = corral_search::parse_selectors(&selectors)?;
            let labels = labels.as_deref().map(parse_labels).transpose()?;
            let matched = labels.as_ref().map(|l| corral_search::matches_all(&queries, l));
            match cli.output {
                Output::Human => {
                    for q in &queries {
                        for term in q.terms() {
                            println!("{}", term);
                        }
                    }
                    if let Some(m) = matched { println!("match: {}", m); }
                }
                Output::Json => {
                    let rendered: Vec<Vec<String>> =
                        queries.iter().map(|q| q.terms().iter().map(|t| t.to_string()).collect()).collect();
                    println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "queries": rendered, "match": matched }))?);
                }
            }
        }
        Commands::Demo { id } => demo::run(cli.output, &id).await?,
    }

    Ok(())
}
