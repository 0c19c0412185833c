//! Kubernetes backend
//!
//! Cross-references declared container limits from pod specs with measured
//! usage from the metrics extension. Two sequential API calls per cycle; a
//! failure of either skips the cycle.
//!
//! Samples are named `{namespace}/{pod}` even though limits are matched per
//! container, so a multi-container pod yields several rows with the same name.

use super::kube_api::{ClusterApi, ContainerUsage};
use super::{CollectError, SampleCollector};
use crate::models::{bytes_to_mib, percent, ContainerKey, ResourceLimits, Sample, UsageMetric};
use crate::observability::{SamplerMetrics, StructuredLogger};
use crate::quantity::{self, QuantityError};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Namespace and label filters applied to both pod and metrics listings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadFilter {
    /// `None` lists all namespaces
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
}

impl WorkloadFilter {
    /// Build a filter, treating empty strings as "not set"
    pub fn new(namespace: Option<String>, label_selector: Option<String>) -> Self {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        Self {
            namespace: non_empty(namespace),
            label_selector: non_empty(label_selector),
        }
    }
}

/// Construction options for [`KubernetesCollector`]
#[derive(Debug, Clone, Default)]
pub struct KubernetesOptions {
    pub filter: WorkloadFilter,
    /// Log every produced sample
    pub debug: bool,
}

/// Collects samples from a cluster's pods
pub struct KubernetesCollector {
    api: Arc<dyn ClusterApi>,
    options: KubernetesOptions,
    logger: StructuredLogger,
    metrics: SamplerMetrics,
}

impl KubernetesCollector {
    pub fn new(api: Arc<dyn ClusterApi>, options: KubernetesOptions) -> Self {
        let logger = StructuredLogger::new("kubernetes", options.debug);
        Self {
            api,
            options,
            logger,
            metrics: SamplerMetrics::new(),
        }
    }
}

#[async_trait]
impl SampleCollector for KubernetesCollector {
    fn backend(&self) -> &'static str {
        "kubernetes"
    }

    async fn collect(&self) -> Result<Vec<Sample>, CollectError> {
        let captured_at = Utc::now();
        let filter = &self.options.filter;

        let pods = self
            .api
            .list_pods(filter)
            .await
            .map_err(CollectError::ListPods)?;
        let limits = build_limit_index(&pods);

        let pod_metrics = self
            .api
            .list_pod_metrics(filter)
            .await
            .map_err(CollectError::ListMetrics)?;

        debug!(
            pods = pods.len(),
            containers_with_limits = limits.len(),
            pod_metrics = pod_metrics.len(),
            "Listed pods and metrics"
        );

        let mut samples = Vec::new();
        for pod in &pod_metrics {
            let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
            let pod_name = pod.metadata.name.as_deref().unwrap_or_default();

            for container in &pod.containers {
                let key = ContainerKey::new(namespace, pod_name, container.name.as_str());

                let usage = match parse_usage(container) {
                    Ok(usage) => usage,
                    Err(e) => {
                        warn!(
                            namespace = %namespace,
                            pod = %pod_name,
                            container = %container.name,
                            error = %e,
                            "Skipping container with unreadable usage"
                        );
                        self.metrics.inc_entity_errors();
                        continue;
                    }
                };

                let limit = limits.get(&key).copied().unwrap_or_else(|| {
                    debug!(
                        namespace = %namespace,
                        pod = %pod_name,
                        container = %container.name,
                        "No declared limits for container"
                    );
                    ResourceLimits::default()
                });

                let sample = to_sample(&key, usage, limit, captured_at);
                self.logger.log_sample(&sample);
                samples.push(sample);
            }
        }

        Ok(samples)
    }
}

fn to_sample(
    key: &ContainerKey,
    usage: UsageMetric,
    limit: ResourceLimits,
    captured_at: chrono::DateTime<Utc>,
) -> Sample {
    let used_bytes = usage.memory_bytes as f64;
    let limit_bytes = limit.memory_bytes as f64;

    Sample::new(
        captured_at,
        key.pod_name(),
        percent(usage.cpu_millis as f64, limit.cpu_millis as f64),
        bytes_to_mib(used_bytes),
        bytes_to_mib(limit_bytes),
        percent(used_bytes, limit_bytes),
    )
}

/// Index declared CPU and memory limits by container
///
/// Missing limits are zero. Unparseable limits are logged and also treated as
/// zero, so they never fail the cycle.
pub fn build_limit_index(pods: &[Pod]) -> HashMap<ContainerKey, ResourceLimits> {
    let mut index = HashMap::new();

    for pod in pods {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
        let Some(spec) = &pod.spec else { continue };

        for container in &spec.containers {
            let declared = container
                .resources
                .as_ref()
                .and_then(|r| r.limits.as_ref());

            let limits = ResourceLimits {
                cpu_millis: limit_value(declared, "cpu", quantity::cpu_millis, pod_name),
                memory_bytes: limit_value(declared, "memory", quantity::memory_bytes, pod_name),
            };

            index.insert(
                ContainerKey::new(namespace, pod_name, container.name.as_str()),
                limits,
            );
        }
    }

    index
}

fn limit_value(
    declared: Option<&BTreeMap<String, Quantity>>,
    resource: &str,
    convert: fn(&str) -> Result<i64, QuantityError>,
    pod_name: &str,
) -> i64 {
    let Some(quantity) = declared.and_then(|limits| limits.get(resource)) else {
        return 0;
    };

    convert(&quantity.0).unwrap_or_else(|e| {
        warn!(
            pod = %pod_name,
            resource = %resource,
            error = %e,
            "Ignoring unparseable limit"
        );
        0
    })
}

fn parse_usage(container: &ContainerUsage) -> Result<UsageMetric, QuantityError> {
    let read = |resource: &str, convert: fn(&str) -> Result<i64, QuantityError>| {
        container
            .usage
            .get(resource)
            .map(|q| convert(&q.0))
            .unwrap_or(Ok(0))
    };

    Ok(UsageMetric {
        cpu_millis: read("cpu", quantity::cpu_millis)?,
        memory_bytes: read("memory", quantity::memory_bytes)?,
    })
}
