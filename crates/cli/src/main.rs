use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use keel_action::{ActionClientGetter, HelmCliGetter, ManifestApplier};
use keel_apply::KubeApplier;
use keel_controller::{Controller, RunnerConfig};
use keel_core::watches::{self, WatchDefaults};
use keel_kubehub::{watch_primary, ApiResolver, KubeObjectClient, KubeWatchRegistrar};
use keel_metrics::Registry;
use keel_reconciler::{ObjectClient, Reconciler};
use keel_store::ReleaseLocks;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "keel-operator", version, about = "Reconciles custom resources into Helm releases")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Print the version
    Version,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Address the Prometheus exporter listens on
    #[arg(long = "metrics-addr", default_value = "0.0.0.0:8383")]
    metrics_addr: SocketAddr,

    /// Watches file mapping kinds to charts
    #[arg(long = "watches-file", env = "WATCHES_FILE", default_value = "./watches.yaml")]
    watches_file: PathBuf,

    /// Default resync period for every watch, e.g. 30s or 1m; 0 disables
    #[arg(long = "reconcile-period", value_parser = parse_period, default_value = "0")]
    reconcile_period: Duration,

    /// Default maximum concurrent reconciles per kind
    #[arg(long = "max-concurrent-reconciles", default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    max_concurrent_reconciles: u64,

    /// Deprecated alias of --max-concurrent-reconciles
    #[arg(long = "max-workers", hide = true)]
    max_workers: Option<usize>,

    /// Namespace to watch (default: all namespaces)
    #[arg(long = "namespace", env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Helm binary used for release actions
    #[arg(long = "helm-bin", env = "HELM_BIN", default_value = "helm")]
    helm_bin: PathBuf,
}

impl RunArgs {
    fn defaults(&self) -> WatchDefaults {
        let mut max = self.max_concurrent_reconciles as usize;
        if let Some(w) = self.max_workers {
            warn!("--max-workers is deprecated, use --max-concurrent-reconciles");
            if max == 1 { max = w.max(1); }
        }
        WatchDefaults { reconcile_period: self.reconcile_period, max_concurrent_reconciles: max }
    }

    fn namespace(&self) -> Option<String> { self.namespace.clone().filter(|n| !n.is_empty()) }
}

fn parse_period(s: &str) -> Result<Duration, humantime::DurationError> {
    if s.trim() == "0" { return Ok(Duration::ZERO); }
    humantime::parse_duration(s)
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: SocketAddr) {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    match builder.with_http_listener(addr).install() {
        Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
        Err(e) => warn!(error = %e, "failed to install metrics exporter"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Version => {
            println!("keel-operator {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(args) => {
            init_tracing();
            init_metrics(args.metrics_addr);
            run(args).await
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let defaults = args.defaults();
    let descriptors = watches::load(&args.watches_file, &defaults)
        .with_context(|| format!("loading watches from {}", args.watches_file.display()))?;
    if descriptors.is_empty() {
        bail!("{} declares no watches", args.watches_file.display());
    }
    let namespace = args.namespace();
    info!(watches = descriptors.len(), ns = ?namespace, "starting operator");

    let resolver = Arc::new(ApiResolver::new(keel_kubehub::client().await?));
    let applier: Arc<dyn ManifestApplier> = Arc::new(KubeApplier::new(Arc::clone(&resolver)));
    let getter: Arc<dyn ActionClientGetter> = Arc::new(HelmCliGetter::new(args.helm_bin.clone(), applier));

    // One lock map for every kind: the release key does not include the kind.
    let slots: usize = descriptors.iter().map(|d| d.max_concurrent_reconciles).sum();
    let locks = Arc::new(ReleaseLocks::new(slots));

    let cancel = CancellationToken::new();
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    for d in descriptors {
        let gvk = d.gvk.clone();
        resolver.resolve(&gvk).await.with_context(|| format!("resolving watched kind {}", gvk))?;
        info!(
            gvk = %gvk,
            chart = %d.chart.name,
            period = ?d.reconcile_period,
            max_concurrent = d.max_concurrent_reconciles,
            dependents = d.watch_dependent_resources,
            "watch configured"
        );
        let objects: Arc<dyn ObjectClient> = Arc::new(KubeObjectClient::new(Arc::clone(&resolver), gvk.clone()));
        let cfg = RunnerConfig::from_env(d.max_concurrent_reconciles);
        let ctrl = Controller::new_with(&gvk.key(), cfg, |trigger| {
            let registrar = Arc::new(KubeWatchRegistrar::new(Arc::clone(&resolver), namespace.clone(), trigger, cancel.clone()));
            Arc::new(Reconciler::new(d, objects, Arc::clone(&getter), registrar, Arc::clone(&locks)))
        });
        let predicate = Registry::new_info(&gvk.kind).predicate();
        tasks.spawn(watch_primary(Arc::clone(&resolver), gvk, namespace.clone(), ctrl.trigger(), predicate, cancel.clone()));
        let token = cancel.clone();
        tasks.spawn(async move {
            ctrl.run(token).await;
            Ok(())
        });
    }

    tokio::select! {
        _ = signal::ctrl_c() => info!("interrupt received, shutting down"),
        Some(res) = tasks.join_next() => match res {
            Ok(Ok(())) => warn!("a watch task exited early, shutting down"),
            Ok(Err(e)) => error!(error = ?e, "watch task failed, shutting down"),
            Err(e) => error!(error = %e, "watch task panicked, shutting down"),
        },
    }
    cancel.cancel();
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Err(e)) => warn!(error = ?e, "task ended with error during shutdown"),
            Err(e) => warn!(error = %e, "task failed to join during shutdown"),
            Ok(Ok(())) => {}
        }
    }
    info!("operator stopped");
    Ok(())
}
