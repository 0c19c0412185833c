//! Docker backend
//!
//! Each cycle lists running containers, then fetches one stats snapshot per
//! container with bounded concurrency. All fetches are joined before any
//! sample is returned, and every sample carries the timestamp taken when the
//! cycle started.

use super::docker_api::{ContainerSummary, DockerApi, StatsSnapshot};
use super::{CollectError, SampleCollector};
use crate::models::{bytes_to_mib, percent, Sample};
use crate::observability::{SamplerMetrics, StructuredLogger};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

/// Construction options for [`DockerCollector`]
#[derive(Debug, Clone)]
pub struct DockerOptions {
    /// Upper bound on concurrent stats requests per cycle
    pub max_concurrency: usize,
    /// Log every produced sample
    pub debug: bool,
}

impl Default for DockerOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 32,
            debug: false,
        }
    }
}

/// Collects samples from a single Docker engine
pub struct DockerCollector {
    api: Arc<dyn DockerApi>,
    options: DockerOptions,
    logger: StructuredLogger,
    metrics: SamplerMetrics,
}

impl DockerCollector {
    pub fn new(api: Arc<dyn DockerApi>, options: DockerOptions) -> Self {
        let logger = StructuredLogger::new("docker", options.debug);
        Self {
            api,
            options,
            logger,
            metrics: SamplerMetrics::new(),
        }
    }

    async fn sample_container(
        &self,
        container: &ContainerSummary,
        captured_at: DateTime<Utc>,
    ) -> Option<Sample> {
        let name = entity_name(&container.names);

        let stats = match self.api.container_stats(&container.id).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(container = %name, error = %e, "Failed to fetch container stats");
                self.metrics.inc_entity_errors();
                return None;
            }
        };

        let (mem_usage_mb, mem_limit_mb, mem_pct) = memory_usage(&stats);
        Some(Sample::new(
            captured_at,
            name,
            cpu_percent(&stats),
            mem_usage_mb,
            mem_limit_mb,
            mem_pct,
        ))
    }
}

#[async_trait]
impl SampleCollector for DockerCollector {
    fn backend(&self) -> &'static str {
        "docker"
    }

    async fn collect(&self) -> Result<Vec<Sample>, CollectError> {
        let captured_at = Utc::now();

        let containers = self
            .api
            .list_containers()
            .await
            .map_err(CollectError::ListContainers)?;

        debug!(containers = containers.len(), "Listed running containers");

        let samples: Vec<Sample> = stream::iter(containers)
            .map(|container| async move { self.sample_container(&container, captured_at).await })
            .buffer_unordered(self.options.max_concurrency.max(1))
            .filter_map(|sample| async move { sample })
            .collect()
            .await;

        for sample in &samples {
            self.logger.log_sample(sample);
        }

        Ok(samples)
    }
}

/// CPU utilisation from the current and previous cumulative counters
///
/// Returns zero when the host counter did not advance or the container
/// counter went backwards (first read, restart, wraparound).
pub fn cpu_percent(stats: &StatsSnapshot) -> f64 {
    let cpu_delta = i128::from(stats.cpu_stats.cpu_usage.total_usage)
        - i128::from(stats.precpu_stats.cpu_usage.total_usage);
    let sys_delta = i128::from(stats.cpu_stats.system_cpu_usage)
        - i128::from(stats.precpu_stats.system_cpu_usage);

    if sys_delta <= 0 || cpu_delta < 0 {
        return 0.0;
    }

    let online_cpus = match stats.cpu_stats.online_cpus {
        0 => 1.0,
        n => f64::from(n),
    };

    (cpu_delta as f64 / sys_delta as f64) * online_cpus * 100.0
}

/// Working-set memory as `(usage_mb, limit_mb, pct)`
///
/// Reclaimable page cache is subtracted from raw usage: `inactive_file` when
/// present and positive, otherwise `cache`.
pub fn memory_usage(stats: &StatsSnapshot) -> (f64, f64, f64) {
    let memory = &stats.memory_stats;
    let counter = |name: &str| memory.stats.get(name).copied().filter(|&v| v > 0);

    let reclaimable = counter("inactive_file")
        .or_else(|| counter("cache"))
        .unwrap_or(0);
    let usage = memory.usage.saturating_sub(reclaimable) as f64;
    let limit = memory.limit as f64;

    (bytes_to_mib(usage), bytes_to_mib(limit), percent(usage, limit))
}

/// First container name without its leading `/`, or `unknown` when there is
/// no usable name
pub fn entity_name(names: &[String]) -> String {
    names
        .first()
        .map(|name| name.strip_prefix('/').unwrap_or(name))
        .filter(|name| !name.is_empty())
        .unwrap_or("unknown")
        .to_string()
}
