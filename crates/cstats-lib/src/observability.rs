//! Observability for the sampler
//!
//! Provides:
//! - Prometheus metrics about the daemon itself (cycles, rows written, cycle latency)
//! - Structured tracing events for lifecycle and per-sample debug output

use crate::models::Sample;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};

/// Histogram buckets for cycle duration (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<SamplerMetricsInner> = OnceLock::new();

struct SamplerMetricsInner {
    cycles_total: IntCounterVec,
    samples_written_total: IntCounter,
    entity_errors_total: IntCounter,
    cycle_duration_seconds: Histogram,
    entities_last_cycle: IntGauge,
}

impl SamplerMetricsInner {
    fn new() -> Self {
        Self {
            cycles_total: register_int_counter_vec!(
                "cstats_cycles_total",
                "Collection cycles by outcome",
                &["outcome"]
            )
            .expect("Failed to register cycles_total"),

            samples_written_total: register_int_counter!(
                "cstats_samples_written_total",
                "Rows appended to the sample file"
            )
            .expect("Failed to register samples_written_total"),

            entity_errors_total: register_int_counter!(
                "cstats_entity_errors_total",
                "Entities skipped because their stats could not be read"
            )
            .expect("Failed to register entity_errors_total"),

            cycle_duration_seconds: register_histogram!(
                "cstats_cycle_duration_seconds",
                "Time spent collecting and persisting one cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_duration_seconds"),

            entities_last_cycle: register_int_gauge!(
                "cstats_entities_last_cycle",
                "Samples produced by the most recent cycle"
            )
            .expect("Failed to register entities_last_cycle"),
        }
    }
}

/// Handle to the process-wide sampler metrics
///
/// Clones share the same underlying metrics.
#[derive(Clone)]
pub struct SamplerMetrics {
    _private: (),
}

impl Default for SamplerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SamplerMetrics {
    /// Create a handle, registering the metrics on first use
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(SamplerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &SamplerMetricsInner {
        GLOBAL_METRICS.get_or_init(SamplerMetricsInner::new)
    }

    /// Count a cycle with the given outcome (`completed`, `skipped`)
    pub fn inc_cycles(&self, outcome: &str) {
        self.inner()
            .cycles_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn add_samples_written(&self, rows: u64) {
        self.inner().samples_written_total.inc_by(rows);
    }

    pub fn inc_entity_errors(&self) {
        self.inner().entity_errors_total.inc();
    }

    pub fn observe_cycle_duration(&self, seconds: f64) {
        self.inner().cycle_duration_seconds.observe(seconds);
    }

    pub fn set_entities_last_cycle(&self, count: i64) {
        self.inner().entities_last_cycle.set(count);
    }
}

/// Structured logger for sampler events
///
/// Per-sample events are only emitted when the owning backend was built with
/// debug enabled.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    backend: &'static str,
    debug: bool,
}

impl StructuredLogger {
    pub fn new(backend: &'static str, debug: bool) -> Self {
        Self { backend, debug }
    }

    /// Log one produced sample
    pub fn log_sample(&self, sample: &Sample) {
        if !self.debug {
            return;
        }
        debug!(
            event = "sample",
            backend = self.backend,
            entity = %sample.entity_name,
            cpu_pct = sample.cpu_pct,
            mem_usage_mb = sample.mem_usage_mb,
            mem_limit_mb = sample.mem_limit_mb,
            mem_pct = sample.mem_pct,
            "Sampled entity"
        );
    }

    /// Log the outcome of one collection cycle
    pub fn log_cycle(&self, collected: usize, written: usize, skipped: bool, elapsed: Duration) {
        debug!(
            event = "cycle_complete",
            backend = self.backend,
            collected = collected,
            written = written,
            skipped = skipped,
            elapsed_ms = elapsed.as_millis() as u64,
            "Collection cycle complete"
        );
    }

    /// Log daemon startup
    pub fn log_startup(&self, version: &str, outfile: &str, interval_secs: u64) {
        info!(
            event = "sampler_started",
            backend = self.backend,
            version = %version,
            outfile = %outfile,
            interval_secs = interval_secs,
            "Collecting stats (Ctrl+C to stop)"
        );
    }

    /// Log daemon shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "sampler_shutdown",
            backend = self.backend,
            reason = %reason,
            "Sampler shutting down"
        );
    }
}
