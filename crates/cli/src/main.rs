use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use classy_controller::{run_event_mapper, spawn_workers, warm_start, Reconciler, ReportCollector, ReportMode, Settings, WorkQueue};
use classy_core::ControlPlaneEndpoint;
use classy_deployer::LocalDeployer;
use classy_kubehub::{spawn_watchers, KubeFleetApi, KubeRemoteApi};
use classy_store::{ConsistencyIndex, KeyManager};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "classyd", version, about = "Fleet classification controller")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). CLASSY_LOG overrides.
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// How match reports reach the management cluster
    #[arg(long = "report-mode", value_enum, env = "CLASSY_REPORT_MODE", default_value_t = Mode::Collect)]
    report_mode: Mode,

    /// Management cluster endpoint handed to agents, scheme://host:port (agent-push only)
    #[arg(long = "control-plane-endpoint", env = "CLASSY_CONTROL_PLANE_ENDPOINT")]
    control_plane_endpoint: Option<String>,

    /// Classifiers reconciled concurrently
    #[arg(long = "concurrent-reconciles", env = "CLASSY_CONCURRENT_RECONCILES", default_value_t = 10)]
    concurrent_reconciles: usize,

    /// Deployer worker count
    #[arg(long = "deployer-workers", env = "CLASSY_DEPLOYER_WORKERS", default_value_t = 10)]
    deployer_workers: usize,

    /// Deployer queue capacity; dispatch is refused when full
    #[arg(long = "queue-capacity", env = "CLASSY_QUEUE_CAPACITY", default_value_t = 1024)]
    queue_capacity: usize,

    /// Report collection interval in seconds (collect mode)
    #[arg(long = "collect-interval-secs", env = "CLASSY_COLLECT_INTERVAL_SECS", default_value_t = 20)]
    collect_interval_secs: u64,

    /// Retry interval in seconds for classifiers that have not converged
    #[arg(long = "requeue-secs", env = "CLASSY_REQUEUE_SECS", default_value_t = 20)]
    requeue_secs: u64,

    /// Upper bound in seconds for one deploy or cleanup request
    #[arg(long = "deploy-timeout-secs", env = "CLASSY_DEPLOY_TIMEOUT_SECS", default_value_t = 300)]
    deploy_timeout_secs: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Mode {
    Collect,
    AgentPush,
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        let mode = match self.report_mode {
            Mode::Collect => ReportMode::CollectFromManagement,
            Mode::AgentPush => {
                let Some(raw) = self.control_plane_endpoint.as_deref() else {
                    bail!("--control-plane-endpoint is required with --report-mode agent-push");
                };
                let endpoint = ControlPlaneEndpoint::parse(raw).context("invalid --control-plane-endpoint")?;
                ReportMode::AgentPush { endpoint }
            }
        };
        if self.requeue_secs == 0 || self.deploy_timeout_secs == 0 {
            bail!("--requeue-secs and --deploy-timeout-secs must be positive");
        }
        Ok(Settings {
            mode,
            requeue: Duration::from_secs(self.requeue_secs),
            deploy_timeout: Duration::from_secs(self.deploy_timeout_secs),
        })
    }
}

fn init_tracing(verbose: u8) {
    let fallback = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env = std::env::var("CLASSY_LOG").unwrap_or_else(|_| fallback.to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CLASSY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CLASSY_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    init_metrics();
    let settings = match cli.settings() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return Err(e);
        }
    };
    info!(mode = ?cli.report_mode, workers = cli.concurrent_reconciles, "classyd starting");

    let client = kube::Client::try_default().await.context("building kube client")?;
    let fleet = Arc::new(KubeFleetApi::new(client.clone()));
    let remote = Arc::new(KubeRemoteApi::new(client.clone()));
    let deployer = Arc::new(LocalDeployer::spawn(cli.deployer_workers, cli.queue_capacity));
    let keys = Arc::new(KeyManager::new());
    let index = Arc::new(ConsistencyIndex::new());

    warm_start(fleet.as_ref(), &keys, &index).await.context("warm start")?;

    let push = settings.mode.is_push();
    let reconciler = Arc::new(Reconciler::new(
        fleet.clone(),
        remote.clone(),
        deployer,
        keys,
        Arc::clone(&index),
        settings,
    ));

    let queue = WorkQueue::new();
    for name in index.known_classifiers() {
        queue.add(&name);
    }
    let workers = spawn_workers(Arc::clone(&reconciler), queue.clone(), cli.concurrent_reconciles);

    let (event_tx, event_rx) = mpsc::channel(cli.queue_capacity.max(1));
    let watchers = spawn_watchers(client, event_tx, push);
    let mapper = tokio::spawn(run_event_mapper(event_rx, Arc::clone(&index), queue.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let collector = (!push).then(|| {
        let c = ReportCollector::new(fleet, remote, Duration::from_secs(cli.collect_interval_secs.max(1)));
        tokio::spawn(c.run(shutdown_rx))
    });

    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Ctrl-C received; shutting down");

    let _ = shutdown_tx.send(true);
    for w in watchers.iter() {
        w.abort();
    }
    mapper.abort();
    queue.close();
    for w in workers {
        let _ = w.await;
    }
    if let Some(c) = collector {
        let _ = c.await;
    }
    info!("classyd stopped");
    Ok(())
}
