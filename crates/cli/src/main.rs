use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tern_controller::{Controller, Reconciler, ResourceEvent, RunningController};
use tern_core::{EngineConfig, ObjectKey, Snapshot};
use tern_kubehub::{kube_store::parse_gvk_key, KubeStore, RemoteStore};
use tern_store::Cache;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "ternctl", version, about = "Tern: cached, reconciled views of Kubernetes resources")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Only watch this namespace (namespaced kinds)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Label selector, e.g. "app=web,tier!=db"
    #[arg(short = 'l', long = "selector", global = true)]
    selector: Option<String>,

    /// Resync period in seconds; 0 disables
    #[arg(long = "resync-secs", global = true, env = "TERN_RESYNC_SECS")]
    resync_secs: Option<u64>,

    #[arg(long = "workers", global = true, env = "TERN_WORKERS")]
    workers: Option<usize>,

    /// Give up on a key after this many retries; 0 retries forever
    #[arg(long = "max-retries", global = true, env = "TERN_MAX_RETRIES")]
    max_retries: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine for a GVK and print +/~/- events until Ctrl-C
    Watch {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
    },
    /// Sync the cache for a GVK and list it
    Ls {
        gvk: String,
    },
    /// Sync the cache for a GVK and print one object from it
    Get {
        gvk: String,
        name: String,
    },
}

fn init_tracing() {
    let env = std::env::var("TERN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TERN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TERN_METRICS_ADDR; expected host:port");
        }
    }
}

fn engine_config(cli: &Cli) -> EngineConfig {
    let mut cfg = EngineConfig::from_env();
    if let Some(secs) = cli.resync_secs {
        cfg = cfg.with_resync((secs > 0).then(|| Duration::from_secs(secs)));
    }
    if let Some(n) = cli.workers {
        cfg = cfg.with_workers(n.max(1));
    }
    if let Some(n) = cli.max_retries {
        cfg = cfg.with_max_retries((n > 0).then_some(n));
    }
    cfg
}

/// Reconciler for the CLI: the engine only needs to keep the cache warm.
struct LogReconciler;

#[async_trait]
impl Reconciler for LogReconciler {
    async fn reconcile(&self, key: &ObjectKey, current: Option<Arc<Snapshot>>) -> Result<()> {
        match current {
            Some(s) => debug!(key = %key, rv = %s.resource_version(), "reconcile"),
            None => debug!(key = %key, "reconcile (gone)"),
        }
        Ok(())
    }
}

async fn start(cli: &Cli, gvk: &str, stop: &CancellationToken) -> Result<RunningController> {
    parse_gvk_key(gvk)?;
    let store = KubeStore::try_default()
        .await
        .context("connecting to cluster (kubeconfig or in-cluster)")?
        .with_namespace(cli.namespace.clone())
        .with_label_selector(cli.selector.clone());
    let remote: Arc<dyn RemoteStore> = Arc::new(store);
    Ok(Controller::new(remote, engine_config(cli)).watch(gvk, Arc::new(LogReconciler)).start(stop.clone()))
}

/// Wait for the first listing, bounded by `TERN_WAIT_SECS` (default 8).
async fn sync_cache(running: &RunningController, gvk: &str) -> Result<Cache> {
    let wait_secs = std::env::var("TERN_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(8);
    match tokio::time::timeout(Duration::from_secs(wait_secs), running.wait_for_cache_sync()).await {
        Ok(true) => {}
        Ok(false) => bail!("engine stopped before the {gvk} cache synced"),
        Err(_) => warn!(gvk = %gvk, wait_secs, "cache not synced yet; output may be incomplete"),
    }
    running.cache(gvk).ok_or_else(|| anyhow!("no cache for {gvk}"))
}

async fn shutdown(stop: CancellationToken, running: RunningController) -> Result<()> {
    stop.cancel();
    running.join().await
}

#[derive(Serialize)]
struct Row<'a> {
    namespace: Option<&'a str>,
    name: &'a str,
    resource_version: &'a str,
    creation_timestamp: Option<&'a str>,
}

fn row(s: &Snapshot) -> Row<'_> {
    Row {
        namespace: s.key().namespace.as_deref(),
        name: &s.key().name,
        resource_version: s.resource_version(),
        creation_timestamp: s.creation_timestamp(),
    }
}

fn print_table(items: &[Arc<Snapshot>], now: DateTime<Utc>) {
    println!("{:<20} {:<40} {:<12} AGE", "NAMESPACE", "NAME", "RV");
    for s in items {
        let ns = s.key().namespace.as_deref().unwrap_or("-");
        println!("{:<20} {:<40} {:<12} {}", ns, s.key().name, s.resource_version(), render_age(s.creation_timestamp(), now));
    }
}

fn print_event(output: Output, ev: &ResourceEvent) -> Result<()> {
    let (sign, kind, snap) = match ev {
        ResourceEvent::Added(s) => ('+', "added", s),
        ResourceEvent::Updated { new, .. } => ('~', "updated", new),
        ResourceEvent::Deleted(s) => ('-', "deleted", s),
    };
    match output {
        Output::Human => println!("{} {}", sign, display_key(snap.key())),
        Output::Json | Output::Yaml => {
            #[derive(Serialize)]
            struct Event<'a> {
                event: &'a str,
                #[serde(flatten)]
                row: Row<'a>,
            }
            let ev = Event { event: kind, row: row(snap) };
            if output == Output::Json {
                println!("{}", serde_json::to_string(&ev)?);
            } else {
                print!("---\n{}", serde_yaml::to_string(&ev)?);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let stop = CancellationToken::new();

    match &cli.command {
        Commands::Watch { gvk } => {
            info!(gvk = %gvk, ns = ?cli.namespace, selector = ?cli.selector, "watch invoked");
            let running = start(&cli, gvk, &stop).await?;
            let mut events = running.subscribe();
            let mut failures = running.subscribe_failures();
            loop {
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        info!("interrupted; shutting down");
                        break;
                    }
                    ev = events.recv() => match ev {
                        Ok(ev) => print_event(cli.output, &ev)?,
                        Err(RecvError::Lagged(n)) => warn!(skipped = n, "output fell behind; events skipped"),
                        Err(RecvError::Closed) => break,
                    },
                    f = failures.recv() => if let Ok(f) = f {
                        warn!(key = %f.key, attempts = f.attempts, error = %f.error, "reconcile gave up");
                    },
                }
            }
            shutdown(stop, running).await?;
        }
        Commands::Ls { gvk } => {
            info!(gvk = %gvk, ns = ?cli.namespace, "ls invoked");
            let running = start(&cli, gvk, &stop).await?;
            let cache = sync_cache(&running, gvk).await?;
            let items = cache.list();
            match cli.output {
                Output::Human => print_table(&items, Utc::now()),
                Output::Json => {
                    let rows: Vec<_> = items.iter().map(|s| row(s)).collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
                Output::Yaml => {
                    let rows: Vec<_> = items.iter().map(|s| row(s)).collect();
                    print!("{}", serde_yaml::to_string(&rows)?);
                }
            }
            shutdown(stop, running).await?;
        }
        Commands::Get { gvk, name } => {
            info!(gvk = %gvk, name = %name, ns = ?cli.namespace, "get invoked");
            let running = start(&cli, gvk, &stop).await?;
            let cache = sync_cache(&running, gvk).await?;
            let found = find(&cache, cli.namespace.as_deref(), name);
            shutdown(stop, running).await?;
            let obj = found?;
            match cli.output {
                Output::Human => print_table(std::slice::from_ref(&obj), Utc::now()),
                Output::Json => println!("{}", serde_json::to_string_pretty(obj.body())?),
                Output::Yaml => print!("{}", serde_yaml::to_string(obj.body())?),
            }
        }
    }

    Ok(())
}

/// Look `name` up in the cache. Without a namespace the name must be unique across namespaces.
fn find(cache: &Cache, namespace: Option<&str>, name: &str) -> Result<Arc<Snapshot>> {
    if namespace.is_some() {
        return cache.get_by_name(namespace, name).ok_or_else(|| anyhow!("{} {} not found", cache.kind(), name));
    }
    let mut hits = cache.list_where(|s| s.key().name == name);
    match hits.len() {
        0 => bail!("{} {} not found", cache.kind(), name),
        1 => Ok(hits.remove(0)),
        n => bail!("{} {} is ambiguous ({} namespaces); pass --ns", cache.kind(), name, n),
    }
}

fn display_key(key: &ObjectKey) -> String {
    match &key.namespace {
        Some(ns) => format!("{}/{}", ns, key.name),
        None => key.name.clone(),
    }
}

fn render_age(creation_ts: Option<&str>, now: DateTime<Utc>) -> String {
    let Some(created) = creation_ts.and_then(|ts| DateTime::parse_from_rfc3339(ts).ok()) else {
        return "-".to_string();
    };
    let mut secs = (now - created.with_timezone(&Utc)).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
