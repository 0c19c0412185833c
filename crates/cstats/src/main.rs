//! cstats - container stats sampler
//!
//! Samples CPU and memory usage of Docker containers or Kubernetes pods on a
//! fixed interval and appends them to a CSV file until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use cstats_lib::{
    api,
    collector::{
        CollectionLoopBuilder, DockerClient, DockerCollector, DockerOptions, KubeClusterApi,
        KubernetesCollector, KubernetesOptions, SampleCollector, WorkloadFilter,
    },
    health::{components, HealthRegistry},
    observability::StructuredLogger,
    sink::SampleSink,
};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cli;
mod config;

use crate::cli::{Backend, Cli};
use crate::config::{LogFormat, SamplerConfig};

const CSTATS_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SamplerConfig::load(&cli)?;
    init_tracing(&config);

    let backend = cli.command.backend();
    let collector = connect_backend(backend, &config).await?;

    let logger = StructuredLogger::new(collector.backend(), config.debug);

    // Fatal when the output path cannot be created or opened
    let sink = SampleSink::open(&config.outfile)
        .with_context(|| format!("Cannot open output file {}", config.outfile.display()))?;

    let health_registry = HealthRegistry::new();
    health_registry.register(components::COLLECTOR).await;
    health_registry.register(components::SINK).await;

    if let Some(port) = config.api_port {
        let app_state = Arc::new(api::AppState::new(
            health_registry.clone(),
            collector.backend(),
        ));
        tokio::spawn(async move {
            if let Err(e) = api::serve(port, app_state).await {
                error!(error = %e, "API server stopped");
            }
        });
    }

    let collection_loop = CollectionLoopBuilder::new()
        .collector(collector)
        .sink(sink)
        .interval(config.interval())
        .health(health_registry.clone())
        .build()?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone(), logger.clone())?;

    health_registry.set_ready(true).await;
    logger.log_startup(
        CSTATS_VERSION,
        &config.outfile.display().to_string(),
        config.interval_secs,
    );

    collection_loop.run(shutdown).await?;

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(config: &SamplerConfig) {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

/// Build the selected backend; failing to reach the engine or cluster is fatal
async fn connect_backend(
    backend: Backend,
    config: &SamplerConfig,
) -> Result<Arc<dyn SampleCollector>> {
    match backend {
        Backend::Docker => {
            let client =
                DockerClient::connect(config.docker_socket.clone(), config.request_timeout())
                    .await
                    .context("Cannot connect to Docker")?;
            info!(socket = %client.socket_path().display(), "Connected to Docker engine");

            Ok(Arc::new(DockerCollector::new(
                Arc::new(client),
                DockerOptions {
                    max_concurrency: config.max_concurrency,
                    debug: config.debug,
                },
            )))
        }
        Backend::Kubernetes => {
            let api = KubeClusterApi::connect(config.context.as_deref())
                .await
                .context("Cannot connect to Kubernetes")?;

            let filter = WorkloadFilter::new(config.namespace.clone(), config.selector.clone());
            info!(
                namespace = filter.namespace.as_deref().unwrap_or("<all>"),
                selector = filter.label_selector.as_deref().unwrap_or(""),
                "Watching pods"
            );

            Ok(Arc::new(KubernetesCollector::new(
                Arc::new(api),
                KubernetesOptions {
                    filter,
                    debug: config.debug,
                },
            )))
        }
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM
///
/// The collection loop notices between cycles, so an in-flight cycle still
/// writes its samples.
fn spawn_signal_handler(shutdown: CancellationToken, logger: StructuredLogger) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        let reason = tokio::select! {
            _ = sigint.recv() => "SIGINT received",
            _ = sigterm.recv() => "SIGTERM received",
        };
        logger.log_shutdown(reason);
        shutdown.cancel();
    });

    Ok(())
}
