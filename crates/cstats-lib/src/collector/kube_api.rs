//! Kubernetes API access
//!
//! Pods (with their declared limits) come from the core API. Usage comes from
//! the metrics extension (`metrics.k8s.io/v1beta1`), which has no typed
//! bindings in k8s-openapi and is read as a dynamic object.

use super::kubernetes::WorkloadFilter;
use crate::observability::SamplerMetrics;
use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::config::KubeConfigOptions;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{
    api::{Api, ListParams},
    Client, Config,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Measured usage of one pod, as served by the metrics extension
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodMetrics {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub containers: Vec<ContainerUsage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerUsage {
    pub name: String,
    #[serde(default)]
    pub usage: BTreeMap<String, Quantity>,
}

/// Operations the Kubernetes collector needs from the cluster
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List pods matching the filter
    async fn list_pods(&self, filter: &WorkloadFilter) -> Result<Vec<Pod>>;

    /// List per-container usage for pods matching the filter
    async fn list_pod_metrics(&self, filter: &WorkloadFilter) -> Result<Vec<PodMetrics>>;
}

/// [`ClusterApi`] backed by a kube client
pub struct KubeClusterApi {
    client: Client,
    metrics_resource: ApiResource,
    metrics: SamplerMetrics,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        Self {
            client,
            metrics_resource: ApiResource::from_gvk_with_plural(&gvk, "pods"),
            metrics: SamplerMetrics::new(),
        }
    }

    /// Build a client from the kubeconfig and check the API server answers
    ///
    /// With a context name the kubeconfig is read with that context selected;
    /// otherwise the configuration is inferred (kubeconfig or in-cluster).
    pub async fn connect(context: Option<&str>) -> Result<Self> {
        let config = match context {
            Some(context) => Config::from_kubeconfig(&KubeConfigOptions {
                context: Some(context.to_string()),
                ..Default::default()
            })
            .await
            .with_context(|| format!("Failed to load kubeconfig context '{}'", context))?,
            None => Config::infer()
                .await
                .context("Failed to infer Kubernetes configuration")?,
        };

        let client = Client::try_from(config).context("Failed to create Kubernetes client")?;
        let version = client
            .apiserver_version()
            .await
            .context("Cannot reach Kubernetes API server")?;
        info!(
            version = %version.git_version,
            "Connected to Kubernetes API server"
        );

        Ok(Self::new(client))
    }

    fn list_params(filter: &WorkloadFilter) -> ListParams {
        match filter.label_selector.as_deref() {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_pods(&self, filter: &WorkloadFilter) -> Result<Vec<Pod>> {
        let api: Api<Pod> = match filter.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        let pods = api.list(&Self::list_params(filter)).await?;
        Ok(pods.items)
    }

    async fn list_pod_metrics(&self, filter: &WorkloadFilter) -> Result<Vec<PodMetrics>> {
        let api: Api<DynamicObject> = match filter.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.metrics_resource),
            None => Api::all_with(self.client.clone(), &self.metrics_resource),
        };

        let objects = api.list(&Self::list_params(filter)).await?;
        Ok(decode_pod_metrics(objects.items, &self.metrics))
    }
}

/// Decode listed metrics objects, skipping entries that do not parse
///
/// A malformed entry only costs that pod its samples for the cycle.
fn decode_pod_metrics(objects: Vec<DynamicObject>, metrics: &SamplerMetrics) -> Vec<PodMetrics> {
    objects
        .into_iter()
        .filter_map(|object| {
            let namespace = object.metadata.namespace.clone().unwrap_or_default();
            let name = object.metadata.name.clone().unwrap_or_default();

            match serde_json::to_value(object).and_then(serde_json::from_value) {
                Ok(pod_metrics) => Some(pod_metrics),
                Err(e) => {
                    warn!(
                        namespace = %namespace,
                        pod = %name,
                        error = %e,
                        "Failed to decode pod metrics"
                    );
                    metrics.inc_entity_errors();
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_pod_metrics() {
        let value = serde_json::json!({
            "apiVersion": "metrics.k8s.io/v1beta1",
            "kind": "PodMetrics",
            "metadata": {"name": "web", "namespace": "ns"},
            "timestamp": "2024-05-01T12:30:00Z",
            "window": "15s",
            "containers": [
                {"name": "app", "usage": {"cpu": "250m", "memory": "128Mi"}}
            ]
        });

        let metrics: PodMetrics = serde_json::from_value(value).unwrap();
        assert_eq!(metrics.metadata.name.as_deref(), Some("web"));
        assert_eq!(metrics.containers.len(), 1);
        assert_eq!(metrics.containers[0].usage["cpu"].0, "250m");
    }

    fn metrics_object(name: &str, containers: serde_json::Value) -> DynamicObject {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "pods");
        DynamicObject::new(name, &resource)
            .within("ns")
            .data(serde_json::json!({ "containers": containers }))
    }

    #[test]
    fn test_malformed_entry_skips_only_that_pod() {
        let objects = vec![
            metrics_object(
                "good",
                serde_json::json!([{"name": "app", "usage": {"cpu": "250m", "memory": "128Mi"}}]),
            ),
            // Container entry without a name
            metrics_object("bad", serde_json::json!([{"usage": {"cpu": "1"}}])),
        ];

        let decoded = decode_pod_metrics(objects, &SamplerMetrics::new());

        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].metadata.name.as_deref(), Some("good"));
        assert_eq!(decoded[0].metadata.namespace.as_deref(), Some("ns"));
        assert_eq!(decoded[0].containers[0].usage["memory"].0, "128Mi");
    }

    #[test]
    fn test_metrics_resource_path() {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "pods");
        assert_eq!(resource.api_version, "metrics.k8s.io/v1beta1");
        assert_eq!(resource.plural, "pods");
    }
}
