//! Collection loop
//!
//! Drives one backend at a fixed interval: one cycle immediately, then one per
//! tick, until the shutdown token is cancelled. Cancellation is only observed
//! between cycles; a cycle that has started always runs to completion and its
//! samples are persisted.

use super::SampleCollector;
use crate::health::{components, ComponentHealth, HealthRegistry};
use crate::models::Sample;
use crate::observability::{SamplerMetrics, StructuredLogger};
use crate::sink::{SampleSink, SinkError};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("collection interval must be positive, got {0:?}")]
    InvalidInterval(Duration),

    #[error("{0} is required")]
    Missing(&'static str),
}

/// Run `cycle` now and then once per `period` until `shutdown` is cancelled
///
/// Blocks for the lifetime of the loop and returns the number of cycles run.
/// A zero period is rejected before the first cycle. Ticks missed while a
/// cycle overran are not replayed in a burst.
pub async fn run_every<F, Fut>(
    period: Duration,
    shutdown: CancellationToken,
    mut cycle: F,
) -> Result<u64, ScheduleError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    if period.is_zero() {
        return Err(ScheduleError::InvalidInterval(period));
    }

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cycles = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // Not raced against the token: an in-flight cycle always finishes
        cycle().await;
        cycles += 1;
    }

    Ok(cycles)
}

/// Configuration for the collection loop
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Time between cycle starts (default: 5 seconds)
    pub interval: Duration,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

/// Outcome of one collection cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Samples returned by the backend
    pub collected: usize,
    /// Rows appended to the sink
    pub written: usize,
    /// The backend failed and the cycle produced nothing
    pub skipped: bool,
}

/// Collection loop that feeds one backend's samples into the sink
pub struct CollectionLoop {
    collector: Arc<dyn SampleCollector>,
    /// Only ever locked between awaits, from the single running cycle
    sink: Mutex<SampleSink>,
    config: CollectionConfig,
    metrics: SamplerMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl CollectionLoop {
    /// Create a new collection loop
    pub fn new(
        collector: Arc<dyn SampleCollector>,
        sink: SampleSink,
        config: CollectionConfig,
    ) -> Self {
        let logger = StructuredLogger::new(collector.backend(), false);
        Self {
            collector,
            sink: Mutex::new(sink),
            config,
            metrics: SamplerMetrics::new(),
            logger,
            health: None,
        }
    }

    /// Report cycle outcomes to a health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ScheduleError> {
        info!(
            backend = self.collector.backend(),
            interval_secs = self.config.interval.as_secs_f64(),
            "Starting collection loop"
        );

        let this = &self;
        let cycles = run_every(self.config.interval, shutdown, move || async move {
            this.run_cycle().await;
        })
        .await?;

        info!(
            backend = self.collector.backend(),
            cycles = cycles,
            "Collection loop stopped"
        );
        Ok(())
    }

    /// Collect one batch and append it to the sink
    pub async fn run_cycle(&self) -> CycleReport {
        let start = Instant::now();
        let backend = self.collector.backend();

        let report = match self.collector.collect().await {
            Ok(samples) => {
                let written = self.persist(&samples).await;
                self.set_health(components::COLLECTOR, ComponentHealth::healthy())
                    .await;
                self.metrics.inc_cycles("completed");
                CycleReport {
                    collected: samples.len(),
                    written,
                    skipped: false,
                }
            }
            Err(e) => {
                warn!(backend = backend, error = %e, "Collection cycle skipped");
                self.set_health(
                    components::COLLECTOR,
                    ComponentHealth::degraded(e.to_string()),
                )
                .await;
                self.metrics.inc_cycles("skipped");
                CycleReport {
                    skipped: true,
                    ..Default::default()
                }
            }
        };

        let elapsed = start.elapsed();
        self.metrics.observe_cycle_duration(elapsed.as_secs_f64());
        self.metrics.set_entities_last_cycle(report.collected as i64);

        self.logger
            .log_cycle(report.collected, report.written, report.skipped, elapsed);

        report
    }

    /// Append a batch, stopping at the first write failure.
    /// Returns the number of rows written.
    async fn persist(&self, samples: &[Sample]) -> usize {
        let result = self
            .sink
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .append_batch(samples);

        let (written, failure) = match result {
            Ok(written) => (written, None),
            Err(SinkError::Batch { written, source }) => (written, Some(*source)),
            Err(e) => (0, Some(e)),
        };

        self.metrics.add_samples_written(written as u64);

        match failure {
            Some(e) => {
                error!(
                    error = %e,
                    written = written,
                    dropped = samples.len() - written,
                    "Failed to persist samples"
                );
                self.set_health(components::SINK, ComponentHealth::unhealthy(e.to_string()))
                    .await;
            }
            None => {
                self.set_health(components::SINK, ComponentHealth::healthy())
                    .await;
            }
        }

        written
    }

    async fn set_health(&self, component: &str, health: ComponentHealth) {
        if let Some(registry) = &self.health {
            registry.update(component, health).await;
        }
    }
}

/// Builder for creating the collection loop
pub struct CollectionLoopBuilder {
    collector: Option<Arc<dyn SampleCollector>>,
    sink: Option<SampleSink>,
    config: CollectionConfig,
    health: Option<HealthRegistry>,
}

impl CollectionLoopBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            collector: None,
            sink: None,
            config: CollectionConfig::default(),
            health: None,
        }
    }

    /// Set the backend
    pub fn collector(mut self, collector: Arc<dyn SampleCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Set the sample sink
    pub fn sink(mut self, sink: SampleSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Set the collection interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Set the health registry
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Build the collection loop, validating the interval
    pub fn build(self) -> Result<CollectionLoop, ScheduleError> {
        if self.config.interval.is_zero() {
            return Err(ScheduleError::InvalidInterval(self.config.interval));
        }
        let collector = self.collector.ok_or(ScheduleError::Missing("collector"))?;
        let sink = self.sink.ok_or(ScheduleError::Missing("sink"))?;

        let collection_loop = CollectionLoop::new(collector, sink, self.config);
        Ok(match self.health {
            Some(health) => collection_loop.with_health(health),
            None => collection_loop,
        })
    }
}

impl Default for CollectionLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CollectError, DockerApiError};
    use crate::health::ComponentStatus;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::io::{self, Write};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Writer that fails with ENOSPC once its shared row budget is spent
    struct BudgetWriter {
        budget: Arc<AtomicUsize>,
        rows: Arc<Mutex<Vec<String>>>,
    }

    impl Write for BudgetWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let spend = self
                .budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if spend.is_err() {
                return Err(io::Error::from_raw_os_error(28));
            }
            self.rows
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(buf).into_owned());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Mock collector for testing
    struct MockCollector {
        call_count: AtomicUsize,
        fail: bool,
    }

    impl MockCollector {
        fn new(fail: bool) -> Self {
            Self {
                call_count: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl SampleCollector for MockCollector {
        fn backend(&self) -> &'static str {
            "mock"
        }

        async fn collect(&self) -> Result<Vec<Sample>, CollectError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CollectError::ListContainers(DockerApiError::Status {
                    path: "/containers/json".to_string(),
                    status: 500,
                    body: "boom".to_string(),
                }));
            }

            let now = Utc::now();
            Ok(vec![
                Sample::new(now, "web", 10.0, 100.0, 200.0, 50.0),
                Sample::new(now, "db", 20.0, 50.0, 0.0, 0.0),
            ])
        }
    }

    #[test]
    fn test_collection_config_default() {
        let config = CollectionConfig::default();
        assert_eq!(config.interval, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_every_rejects_zero_interval() {
        let calls = AtomicUsize::new(0);
        let result = run_every(Duration::ZERO, CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {}
        })
        .await;

        assert_eq!(result, Err(ScheduleError::InvalidInterval(Duration::ZERO)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_every_runs_immediately_then_per_interval() {
        let shutdown = CancellationToken::new();
        let started = Instant::now();
        let mut offsets = Vec::new();

        let cycles = run_every(Duration::from_secs(10), shutdown.clone(), || {
            offsets.push(started.elapsed());
            if offsets.len() == 3 {
                shutdown.cancel();
            }
            async {}
        })
        .await
        .unwrap();

        assert_eq!(cycles, 3);
        assert_eq!(
            offsets,
            vec![
                Duration::ZERO,
                Duration::from_secs(10),
                Duration::from_secs(20)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_every_finishes_in_flight_cycle() {
        let shutdown = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));

        let cycles = run_every(Duration::from_secs(1), shutdown.clone(), || {
            let shutdown = shutdown.clone();
            let finished = finished.clone();
            async move {
                shutdown.cancel();
                tokio::time::sleep(Duration::from_secs(30)).await;
                finished.store(true, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();

        assert_eq!(cycles, 1);
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_every_cancelled_before_start() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let cycles = run_every(Duration::from_secs(1), shutdown, || async {})
            .await
            .unwrap();
        assert_eq!(cycles, 0);
    }

    #[tokio::test]
    async fn test_collection_loop_builder() {
        let dir = TempDir::new().unwrap();
        let sink = SampleSink::open(dir.path().join("stats.csv")).unwrap();

        let result = CollectionLoopBuilder::new()
            .collector(Arc::new(MockCollector::new(false)))
            .sink(sink)
            .interval(Duration::from_secs(5))
            .build();

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_collection_loop_builder_missing_collector() {
        let dir = TempDir::new().unwrap();
        let sink = SampleSink::open(dir.path().join("stats.csv")).unwrap();

        let result = CollectionLoopBuilder::new().sink(sink).build();

        assert!(matches!(result, Err(ScheduleError::Missing("collector"))));
    }

    #[tokio::test]
    async fn test_collection_loop_builder_rejects_zero_interval() {
        let result = CollectionLoopBuilder::new()
            .collector(Arc::new(MockCollector::new(false)))
            .interval(Duration::ZERO)
            .build();

        assert!(matches!(result, Err(ScheduleError::InvalidInterval(_))));
    }

    #[tokio::test]
    async fn test_run_cycle_writes_samples() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.csv");
        let collector = Arc::new(MockCollector::new(false));
        let health = HealthRegistry::new();

        let collection_loop = CollectionLoop::new(
            collector.clone(),
            SampleSink::open(&path).unwrap(),
            CollectionConfig::default(),
        )
        .with_health(health.clone());

        let report = collection_loop.run_cycle().await;

        assert_eq!(
            report,
            CycleReport {
                collected: 2,
                written: 2,
                skipped: false
            }
        );
        assert_eq!(crate::sink::read_samples(&path).unwrap().len(), 2);
        assert_eq!(health.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_failed_cycle_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.csv");
        let health = HealthRegistry::new();

        let collection_loop = CollectionLoop::new(
            Arc::new(MockCollector::new(true)),
            SampleSink::open(&path).unwrap(),
            CollectionConfig::default(),
        )
        .with_health(health.clone());

        let report = collection_loop.run_cycle().await;

        assert!(report.skipped);
        assert_eq!(report.written, 0);
        assert!(crate::sink::read_samples(&path).unwrap().is_empty());
        assert_eq!(health.health().await.status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_sink_failure_stops_batch_and_recovers() {
        let budget = Arc::new(AtomicUsize::new(1));
        let rows = Arc::new(Mutex::new(Vec::new()));
        let writer = BudgetWriter {
            budget: budget.clone(),
            rows: rows.clone(),
        };
        let health = HealthRegistry::new();
        health.register(components::SINK).await;

        let collection_loop = CollectionLoop::new(
            Arc::new(MockCollector::new(false)),
            SampleSink::with_writer("stats.csv", writer),
            CollectionConfig::default(),
        )
        .with_health(health.clone());

        // Disk fills after the first row of the batch
        let report = collection_loop.run_cycle().await;
        assert_eq!(report.collected, 2);
        assert_eq!(report.written, 1);
        assert!(!report.skipped);

        let status = health.health().await;
        assert_eq!(status.components[components::SINK].status, ComponentStatus::Unhealthy);
        assert_eq!(status.status, ComponentStatus::Unhealthy);
        assert_eq!(rows.lock().unwrap().len(), 1);

        // Space freed: the next cycle writes in full and the sink is healthy again
        budget.store(10, Ordering::SeqCst);
        let report = collection_loop.run_cycle().await;
        assert_eq!(report.written, 2);

        let status = health.health().await;
        assert_eq!(status.components[components::SINK].status, ComponentStatus::Healthy);

        // The dropped row from the failed cycle never reappears
        let rows = rows.lock().unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].contains(",web,"));
        assert!(rows[1].contains(",web,"));
        assert!(rows[2].contains(",db,"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_keeps_running_after_failed_cycles() {
        let dir = TempDir::new().unwrap();
        let collector = Arc::new(MockCollector::new(true));
        let shutdown = CancellationToken::new();

        let collection_loop = CollectionLoopBuilder::new()
            .collector(collector.clone())
            .sink(SampleSink::open(dir.path().join("stats.csv")).unwrap())
            .interval(Duration::from_secs(5))
            .build()
            .unwrap();

        let handle = tokio::spawn(collection_loop.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_secs(12)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        // t=0, t=5, t=10
        assert_eq!(collector.call_count.load(Ordering::SeqCst), 3);
    }
}
