//! BE Controller - node-local HP/BE co-location controller
//!
//! Runs as a DaemonSet (or next to the Docker daemon) on each node, tracking
//! the node's workloads and arbitrating CPU, network bandwidth and block I/O
//! between latency-critical and best-effort work.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use controller_lib::{
    command::create_runner,
    config::{ControllerConfig, ModeKind},
    context::AppContext,
    control::{BlkioController, CpuController, NetController},
    health::{components, HealthRegistry},
    orchestrator::{ClusterMode, KubeOrchestrator, Orchestrator},
    registry::{run_pod_watch, WorkloadRegistry},
    runtime::{ContainerRuntime, DockerRuntime},
    signal::{KubeletSummary, QosDataStore, RuntimeUtilization, UtilizationSource},
    sink::{InfluxSink, MetricsSink, NoopSink},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Node-local best-effort workload controller
#[derive(Parser)]
#[command(name = "be-controller")]
#[command(author, version, about = "Co-locates best-effort work with latency-critical services", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "BE_CONTROLLER_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long, short)]
    verbose: bool,
}

/// Node identity and the mode-specific collaborators
struct NodeSetup {
    name: String,
    cpu_count: u32,
    mode: ClusterMode,
    utilization: Arc<dyn UtilizationSource>,
}

async fn discover_node(
    config: &ControllerConfig,
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<WorkloadRegistry>,
) -> Result<NodeSetup> {
    match config.mode {
        ModeKind::K8s => {
            let orchestrator = Arc::new(KubeOrchestrator::connect(config.watch_timeout_secs).await?);
            let name = std::env::var("MY_NODE_NAME")
                .context("MY_NODE_NAME must be set when running under Kubernetes")?;
            let cpu_count = orchestrator.node_cpu_count(&name).await?;
            let utilization = Arc::new(KubeletSummary::new(
                &name,
                config.kubelet_stats_port,
                cpu_count,
            )?);
            Ok(NodeSetup {
                name,
                cpu_count,
                mode: ClusterMode::Orchestrated { orchestrator },
                utilization,
            })
        }
        ModeKind::Docker => {
            let name = match std::env::var("MY_NODE_NAME") {
                Ok(name) => name,
                Err(_) => runtime.host_name().await?,
            };
            let cpu_count = runtime.host_cpu_count().await?;
            Ok(NodeSetup {
                name,
                cpu_count,
                mode: ClusterMode::RuntimeOnly,
                utilization: Arc::new(RuntimeUtilization::new(runtime, registry)),
            })
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(fmt::layer().json())
        .init();

    info!(config = %cli.config.display(), "Starting be-controller");

    let config = ControllerConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect().await?);
    let registry = Arc::new(WorkloadRegistry::new());
    let node = discover_node(&config, runtime.clone(), registry.clone()).await?;
    info!(node_name = %node.name, cpu_count = node.cpu_count, mode = node.mode.name(), "Node discovered");

    let slack = Arc::new(QosDataStore::new(&config.qos_data_store_url)?);
    let commands = create_runner(&config);
    let sink: Arc<dyn MetricsSink> = if config.write_metrics {
        Arc::new(InfluxSink::new(&config.influx.url, &config.influx.database)?)
    } else {
        Arc::new(NoopSink)
    };

    let health = HealthRegistry::new();
    health.register_all(components::ALL).await;

    let cpu_count = node.cpu_count;
    let ctx = Arc::new(
        AppContext::builder(node.name, node.cpu_count, config)
            .mode(node.mode)
            .registry(registry)
            .runtime(runtime)
            .commands(commands)
            .slack(slack)
            .utilization(node.utilization)
            .sink(sink)
            .health(health.clone())
            .build()?,
    );
    ctx.logger.log_startup(CONTROLLER_VERSION, ctx.mode.name(), cpu_count);

    let admitted = ctx.mode.set_be_admission(&ctx.node.name, true).await;
    if let Err(e) = &admitted {
        warn!(error = %e, "Cannot open the node to BE work");
    }
    ctx.logger.log_be_admission(true, admitted.is_ok());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let poll = Duration::from_secs(ctx.config.runtime_poll_secs);
    let events = ctx
        .mode
        .watch(ctx.runtime.clone(), &ctx.node.name, poll)
        .await
        .context("opening the pod event stream")?;
    let mut watch_handle = {
        let ctx = ctx.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { run_pod_watch(&ctx, events, shutdown).await })
    };

    let mut loops = vec![tokio::spawn(
        CpuController::new(ctx.clone()).run(shutdown_tx.subscribe()),
    )];
    match NetController::new(ctx.clone()) {
        Ok(controller) => loops.push(tokio::spawn(controller.run(shutdown_tx.subscribe()))),
        Err(e) => {
            error!(error = %e, "Invalid network controller settings");
            health
                .set_degraded(components::NET_CONTROLLER, e.to_string())
                .await;
        }
    }
    match BlkioController::new(ctx.clone()) {
        Ok(controller) => loops.push(tokio::spawn(controller.run(shutdown_tx.subscribe()))),
        Err(e) => {
            error!(error = %e, "Invalid blkio controller settings");
            health
                .set_degraded(components::BLKIO_CONTROLLER, e.to_string())
                .await;
        }
    }

    let app_state = Arc::new(api::AppState::new(health.clone(), ctx.metrics.clone()));
    let api_handle = tokio::spawn(api::serve(ctx.config.api_port, app_state));

    health.set_ready(true).await;

    let outcome: Result<()> = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
            ctx.logger.log_shutdown("SIGINT received");
            Ok(())
        }
        watched = &mut watch_handle => {
            let reason = match watched {
                Ok(Ok(())) => "pod event consumer stopped".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("pod event consumer panicked: {}", e),
            };
            ctx.logger.log_shutdown(&reason);
            Err(anyhow!(reason))
        }
    };

    health.set_ready(false).await;
    let _ = shutdown_tx.send(());
    for handle in loops {
        if let Err(e) = handle.await {
            warn!(error = %e, "Control loop did not stop cleanly");
        }
    }
    api_handle.abort();
    info!("Shutting down");

    outcome
}
