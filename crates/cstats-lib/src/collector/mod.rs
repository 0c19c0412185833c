//! Sample collection backends
//!
//! Two backends convert runtime-specific counters into [`Sample`]s:
//! the Docker engine API (cumulative CPU counters, cgroup memory) and the
//! Kubernetes API (declared limits cross-referenced with metrics-server usage).
//! Exactly one backend is driven by a [`CollectionLoop`] per process.

mod docker;
mod docker_api;
mod kube_api;
mod kubernetes;
mod r#loop;


pub use docker::{cpu_percent, entity_name, memory_usage, DockerCollector, DockerOptions};
pub use docker_api::{
    ContainerSummary, CpuStats, CpuUsage, DockerApi, DockerApiError, DockerClient, MemoryStats,
    StatsSnapshot, DEFAULT_DOCKER_SOCKET,
};
pub use kube_api::{ClusterApi, ContainerUsage, KubeClusterApi, PodMetrics};
pub use kubernetes::{build_limit_index, KubernetesCollector, KubernetesOptions, WorkloadFilter};
pub use r#loop::{
    run_every, CollectionConfig, CollectionLoop, CollectionLoopBuilder, CycleReport, ScheduleError,
};

use crate::models::Sample;
use thiserror::Error;

pub use async_trait::async_trait;

/// Failures that skip a whole collection cycle
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("failed to list containers: {0}")]
    ListContainers(#[source] DockerApiError),

    #[error("failed to list pods: {0}")]
    ListPods(#[source] anyhow::Error),

    #[error("failed to list pod metrics: {0}")]
    ListMetrics(#[source] anyhow::Error),
}

/// Trait for backends that produce one batch of samples per cycle
///
/// An `Err` means the cycle produced nothing. Failures that affect a single
/// container or pod are logged by the backend and the entity is left out of
/// the returned batch.
#[async_trait]
pub trait SampleCollector: Send + Sync {
    /// Short backend name used in logs and metrics
    fn backend(&self) -> &'static str;

    /// Collect one batch of samples sharing a single capture timestamp
    async fn collect(&self) -> Result<Vec<Sample>, CollectError>;
}
