//! TrainJob operator - distributed training job lifecycle management

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tracing::{info, warn};

use trainops_common::crd::TrainJob;
use trainops_common::events::KubeEventPublisher;
use trainops_common::telemetry::{init_telemetry, TelemetryConfig};
use trainops_common::CONTROLLER_NAME;
use trainops_controller::config::DEFAULT_GANG_SCHEDULER;
use trainops_controller::{ControllerConfig, Dispatcher, Expectations, JobReconciler, KubeMutator};

mod runner;

/// TrainJob operator - drives distributed training jobs on Kubernetes
#[derive(Parser, Debug)]
#[command(name = "trainops-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the TrainJob CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Number of concurrent reconcile workers
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Co-schedule each job's pods through a kube-batch PodGroup
    #[arg(long)]
    enable_gang_scheduling: bool,

    /// Scheduler name written into created pods under gang scheduling
    #[arg(long, default_value = DEFAULT_GANG_SCHEDULER)]
    gang_scheduler_name: String,

    /// Interval in seconds between full re-enqueues of every known job
    #[arg(long, default_value_t = 15)]
    resync_period_secs: u64,

    /// How long to wait for the informer caches to sync before giving up
    #[arg(long, default_value_t = 120)]
    cache_sync_timeout_secs: u64,

    /// OTLP endpoint for trace and metric export
    #[arg(long)]
    otlp_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&TrainJob::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: CONTROLLER_NAME.to_string(),
        otlp_endpoint: cli
            .otlp_endpoint
            .clone()
            .or_else(|| std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()),
    })?;

    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = Client::try_default().await?;

    ensure_crd_installed(&client).await?;

    let config = ControllerConfig {
        enable_gang_scheduling: cli.enable_gang_scheduling,
        gang_scheduler_name: cli.gang_scheduler_name.clone(),
        worker_threads: cli.workers,
        resync_period: Duration::from_secs(cli.resync_period_secs),
    };

    // Reflector caches for jobs, pods, and services
    let (store, stream_tasks, dispatcher) = {
        let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
        let mutator = Arc::new(KubeMutator::new(client.clone()));
        let (store, streams) = runner::spawn_reflectors(client.clone());
        let store = Arc::new(store);
        let reconciler = Arc::new(JobReconciler::new(
            store.clone(),
            mutator,
            events.clone(),
            Arc::new(Expectations::new()),
            config.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            reconciler,
            store.clone(),
            events,
            config.clone(),
        ));
        let tasks = runner::drive_streams(streams, dispatcher.clone());
        (store, tasks, dispatcher)
    };

    // Workers must not start against half-filled caches
    info!("waiting for informer caches to sync");
    store
        .wait_until_ready(Duration::from_secs(cli.cache_sync_timeout_secs))
        .await
        .map_err(|e| anyhow::anyhow!("failed to wait for caches to sync: {e}"))?;

    info!(workers = config.worker_threads, "caches synced, starting workers");
    let worker_handles = dispatcher.clone().spawn_workers();
    let resync_handle = tokio::spawn(dispatcher.clone().run_resync());

    runner::wait_for_shutdown_signal().await;

    // Stop intake, drain the queue, and let workers finish their ticks
    dispatcher.shutdown();
    for handle in worker_handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "worker task failed during shutdown");
        }
    }
    resync_handle.abort();
    for task in stream_tasks {
        task.abort();
    }

    info!("shut down cleanly");
    Ok(())
}

/// Install the TrainJob CRD on startup using server-side apply, so the CRD
/// version always matches the operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Api, Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    info!("installing TrainJob CRD");
    crds.patch(
        "trainjobs.trainops.dev",
        &PatchParams::apply(CONTROLLER_NAME).force(),
        &Patch::Apply(&TrainJob::crd()),
    )
    .await?;
    Ok(())
}
