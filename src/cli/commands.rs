use crate::cli::{Commands, RunArgs, SourceKind};
use crate::config::{ConfigStore, LegacyConfig};
use crate::health::Health;
use crate::k8s::lease::replica_identity;
use crate::k8s::{K8sClient, LeaderElector, LeaderFlag};
use crate::metrics::{self, MetricsEngine, SERIES_RESET_INTERVAL};
use crate::operator::{Controller, UrlPerformance};
use crate::pipeline::{Mode, Processor, Rotation};
use crate::rotate::rotate_every_lines;
use crate::server::{AppState, ScrapeServer};
use crate::source::{self, FileTail, KubernetesSource, LogSource, PodSelector};
use crate::VERSION;
use anyhow::{Context, Result};
use kube::CustomResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Run(args) => handle_run(*args).await,
        Commands::Crd => handle_crd(),
    }
}

fn handle_crd() -> Result<()> {
    let yaml = serde_yaml::to_string(&UrlPerformance::crd()).context("Failed to render CRD")?;
    print!("{}", yaml);
    Ok(())
}

async fn handle_run(args: RunArgs) -> Result<()> {
    info!(
        version = VERSION,
        source = ?args.log_source,
        operator_mode = args.operator_mode,
        json_logs = args.json_logs,
        "Starting traefik-officer"
    );

    let shutdown = CancellationToken::new();
    let tasks = TaskTracker::new();
    let health = Arc::new(Health::new());
    let engine = Arc::new(MetricsEngine::new().context("Failed to register metrics")?);

    let client = if args.needs_kubernetes() {
        let client = K8sClient::connect(args.kubeconfig.as_deref(), args.kube_context.as_deref())
            .await
            .context("Failed to connect to Kubernetes")?;
        Some(client)
    } else {
        None
    };

    let mode = match &client {
        Some(client) if args.operator_mode => {
            let store = ConfigStore::new();
            let leader = start_leader_election(&args, client, &tasks, &shutdown);
            let controller =
                Controller::new(client.clone(), store.clone(), engine.clone(), leader, health.clone());
            tasks.spawn(controller.run(shutdown.clone()));
            Mode::Operator(store)
        }
        _ => Mode::Legacy(Arc::new(load_legacy_config(&args).compile())),
    };

    let server = ScrapeServer::bind(
        args.listen_port,
        AppState {
            metrics: engine.clone(),
            health: health.clone(),
        },
    )
    .await
    .context("Failed to start metrics server")?;
    info!(address = %server.local_addr()?, "Serving /metrics and /health");

    let server_shutdown = shutdown.clone();
    tasks.spawn(async move {
        if let Err(e) = server.serve(server_shutdown.clone()).await {
            error!("Metrics server error: {}", e);
            server_shutdown.cancel();
        }
    });

    tasks.spawn(metrics::run_top_paths_ticker(
        engine.clone(),
        Duration::from_secs(args.top_paths_interval.max(1)),
        shutdown.clone(),
    ));
    tasks.spawn(metrics::run_series_reset_ticker(
        engine.clone(),
        SERIES_RESET_INTERVAL,
        shutdown.clone(),
    ));

    let log_source: Box<dyn LogSource> = match (args.log_source, &client) {
        (SourceKind::Kubernetes, Some(client)) => {
            info!(
                namespace = %args.namespace,
                container = %args.container_name,
                selector = %args.pod_label_selector,
                "Kubernetes mode"
            );
            Box::new(
                KubernetesSource::new(
                    client.clone(),
                    PodSelector {
                        namespace: args.namespace.clone(),
                        container: args.container_name.clone(),
                        label_selector: args.pod_label_selector.clone(),
                    },
                )
                .with_sync_interval(Duration::from_secs(args.pod_sync_interval.max(1))),
            )
        }
        _ => {
            info!(path = %args.log_file.display(), "File mode");
            Box::new(FileTail::new(&args.log_file))
        }
    };

    let (lines, source_task) = source::spawn(log_source, shutdown.clone());
    health.update_component("log_source", "running", None);

    let mut processor = Processor::new(args.log_format(), mode, engine.clone(), health.clone());
    if args.log_source == SourceKind::File {
        let every = rotate_every_lines(args.max_accesslog_size);
        info!(
            lines = every,
            max_size_mb = args.max_accesslog_size,
            "Rotating access log periodically"
        );
        processor = processor.with_rotation(Rotation::new(&args.log_file, every));
    }
    let processor_task = tokio::spawn(processor.run(lines));
    health.update_component("log_processor", "running", None);
    health.set_ready();

    tokio::select! {
        result = wait_for_signal() => result?,
        _ = shutdown.cancelled() => warn!("Stopping after a fatal task error"),
    }

    info!("Shutting down");
    shutdown.cancel();

    if let Err(e) = source_task.await {
        error!("Log source task failed: {}", e);
    }
    if let Err(e) = processor_task.await {
        error!("Processor task failed: {}", e);
    }
    tasks.close();
    tasks.wait().await;

    health.update_component("log_source", "closed", None);
    info!("traefik-officer stopped");
    Ok(())
}

fn start_leader_election(
    args: &RunArgs,
    client: &K8sClient,
    tasks: &TaskTracker,
    shutdown: &CancellationToken,
) -> LeaderFlag {
    if !args.leader_elect {
        return LeaderFlag::always();
    }

    let namespace = args
        .lease_namespace
        .clone()
        .or_else(|| std::env::var("POD_NAMESPACE").ok())
        .unwrap_or_else(|| client.default_namespace().to_string());

    let elector = LeaderElector::new(client.leases(&namespace), replica_identity());
    let flag = elector.flag();
    tasks.spawn(elector.run(shutdown.clone()));
    flag
}

/// A missing or broken rules file is not fatal; defaults allow nothing
fn load_legacy_config(args: &RunArgs) -> LegacyConfig {
    let Some(path) = &args.config_file else {
        warn!("No --config-file given, using the default configuration");
        return LegacyConfig::default();
    };

    match LegacyConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load configuration: {}. Using default configuration.", e);
            LegacyConfig::default()
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
        _ = terminate.recv() => info!("Terminate signal received"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Interrupt received");
    Ok(())
}
