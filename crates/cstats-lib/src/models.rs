//! Core data models for the sampler
//!
//! [`Sample`] is the only shape that leaves a collector. Everything else here
//! is intermediate state a backend builds and drops within one cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bytes in one mebibyte
pub const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// One normalized CPU/memory observation of a workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub captured_at: DateTime<Utc>,
    pub entity_name: String,
    pub cpu_pct: f64,
    pub mem_usage_mb: f64,
    pub mem_limit_mb: f64,
    pub mem_pct: f64,
}

impl Sample {
    /// Build a sample, enforcing the non-negative and no-limit invariants.
    ///
    /// Negative or non-finite inputs collapse to zero, and `mem_pct` is
    /// forced to exactly zero when no memory limit is declared.
    pub fn new(
        captured_at: DateTime<Utc>,
        entity_name: impl Into<String>,
        cpu_pct: f64,
        mem_usage_mb: f64,
        mem_limit_mb: f64,
        mem_pct: f64,
    ) -> Self {
        let mem_limit_mb = non_negative(mem_limit_mb);
        let mem_pct = if mem_limit_mb == 0.0 {
            0.0
        } else {
            non_negative(mem_pct)
        };

        Self {
            captured_at,
            entity_name: entity_name.into(),
            cpu_pct: non_negative(cpu_pct),
            mem_usage_mb: non_negative(mem_usage_mb),
            mem_limit_mb,
            mem_pct,
        }
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// `used / limit * 100`, or zero when there is no positive limit
pub fn percent(used: f64, limit: f64) -> f64 {
    if limit > 0.0 {
        used / limit * 100.0
    } else {
        0.0
    }
}

/// Convert a byte count to mebibytes
pub fn bytes_to_mib(bytes: f64) -> f64 {
    bytes / BYTES_PER_MIB
}

/// Identifies one container inside a pod
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerKey {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl ContainerKey {
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }

    /// Pod-scoped display name used as the sample entity
    pub fn pod_name(&self) -> String {
        format!("{}/{}", self.namespace, self.pod)
    }
}

/// Declared limits for a container. Zero means no limit configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_millis: i64,
    pub memory_bytes: i64,
}

/// Measured usage for a container as reported by the metrics API
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageMetric {
    pub cpu_millis: i64,
    pub memory_bytes: i64,
}
