//! Per-test timing metrics and their reporters.
//!
//! The runner measures the phases of every test into a [`PerfStats`] and hands
//! the result to each configured [`PerfReporter`]. A failing reporter is
//! logged and never affects the test outcome.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Aggregated timings of one named phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub count: u64,
    pub elapsed_ns: u64,
    pub success: bool,
}

impl Metric {
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns)
    }
}

/// Free-form description of the test a set of metrics belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub fields: BTreeMap<String, String>,
}

impl Metadata {
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.fields.insert(key.into(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// Collects metrics for one test.
#[derive(Debug, Default)]
pub struct PerfStats {
    metrics: Mutex<BTreeMap<(String, bool), Metric>>,
}

impl PerfStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time `f`; the metric is recorded as failed when `f` returns an error.
    pub fn measure<T>(&self, name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let started = Instant::now();
        let result = f();
        self.record(name, started.elapsed(), result.is_ok());
        result
    }

    pub fn record(&self, name: &str, elapsed: Duration, success: bool) {
        let mut metrics = self.metrics.lock();
        let metric = metrics
            .entry((name.to_string(), success))
            .or_insert_with(|| Metric {
                name: name.to_string(),
                count: 0,
                elapsed_ns: 0,
                success,
            });
        metric.count += 1;
        metric.elapsed_ns = metric
            .elapsed_ns
            .saturating_add(elapsed.as_nanos().min(u64::MAX as u128) as u64);
    }

    pub fn metrics(&self) -> Vec<Metric> {
        self.metrics.lock().values().cloned().collect()
    }
}

pub trait PerfReporter: Send + Sync {
    fn report(&self, metadata: &Metadata, metrics: &[Metric]) -> Result<()>;

    /// Name for logging.
    fn name(&self) -> &str;
}

/// Deliver to every reporter. Failures are logged.
pub fn report_all(reporters: &[Arc<dyn PerfReporter>], metadata: &Metadata, metrics: &[Metric]) {
    for reporter in reporters {
        if let Err(e) = reporter.report(metadata, metrics) {
            warn!(reporter = reporter.name(), error = %e, "perf reporter failed");
        }
    }
}

// =============================================================================
// Reporters
// =============================================================================

/// Logs every metric at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingReporter;

impl PerfReporter for LoggingReporter {
    fn report(&self, metadata: &Metadata, metrics: &[Metric]) -> Result<()> {
        let test = metadata.get("test").unwrap_or("<unknown>");
        for metric in metrics {
            info!(
                test,
                phase = %metric.name,
                count = metric.count,
                elapsed_ms = metric.elapsed().as_secs_f64() * 1000.0,
                success = metric.success,
                "perf"
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "logging"
    }
}

/// Exposes phase timings and test outcomes as Prometheus metrics.
pub struct PrometheusReporter {
    registry: Registry,
    phases: HistogramVec,
    tests: IntCounterVec,
}

impl PrometheusReporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::default();
        let phases = HistogramVec::new(
            HistogramOpts::new("shadow_sandbox_phase_seconds", "Time spent per test phase"),
            &["phase", "success"],
        )?;
        let tests = IntCounterVec::new(
            Opts::new("shadow_sandbox_tests_total", "Tests run, by outcome"),
            &["outcome"],
        )?;
        registry
            .register(Box::new(phases.clone()))
            .context("failed to register phase histogram")?;
        registry
            .register(Box::new(tests.clone()))
            .context("failed to register test counter")?;
        Ok(Self {
            registry,
            phases,
            tests,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("failed to encode metrics")?;
        String::from_utf8(buffer).context("metrics are not utf-8")
    }
}

impl PerfReporter for PrometheusReporter {
    fn report(&self, metadata: &Metadata, metrics: &[Metric]) -> Result<()> {
        for metric in metrics {
            let success = if metric.success { "true" } else { "false" };
            let histogram = self.phases.with_label_values(&[metric.name.as_str(), success]);
            // One observation per measurement, at the mean.
            let mean = metric.elapsed().as_secs_f64() / metric.count.max(1) as f64;
            for _ in 0..metric.count {
                histogram.observe(mean);
            }
        }
        if let Some(outcome) = metadata.get("outcome") {
            self.tests.with_label_values(&[outcome]).inc();
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "prometheus"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_measure_records_success_and_failure_separately() {
        let stats = PerfStats::new();
        stats.measure("body", || Ok(())).unwrap();
        stats.measure("body", || Ok(())).unwrap();
        assert!(stats.measure("body", || -> Result<()> { Err(anyhow!("boom")) }).is_err());

        let metrics = stats.metrics();
        assert_eq!(metrics.len(), 2);
        let failed = metrics.iter().find(|m| !m.success).unwrap();
        let passed = metrics.iter().find(|m| m.success).unwrap();
        assert_eq!(failed.count, 1);
        assert_eq!(passed.count, 2);
    }

    #[test]
    fn test_prometheus_reporter_exposes_metrics() {
        let reporter = PrometheusReporter::new().unwrap();
        let metadata = Metadata::default().with("test", "ButtonTest.clicks").with("outcome", "passed");
        let metrics = vec![Metric {
            name: "body".to_string(),
            count: 2,
            elapsed_ns: 4_000_000,
            success: true,
        }];
        reporter.report(&metadata, &metrics).unwrap();

        let text = reporter.encode().unwrap();
        assert!(text.contains("shadow_sandbox_phase_seconds_count{phase=\"body\",success=\"true\"} 2"));
        assert!(text.contains("shadow_sandbox_tests_total{outcome=\"passed\"} 1"));
    }

    struct FailingReporter;

    impl PerfReporter for FailingReporter {
        fn report(&self, _: &Metadata, _: &[Metric]) -> Result<()> {
            Err(anyhow!("disk full"))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[test]
    fn test_report_all_survives_failing_reporter() {
        let reporters: Vec<Arc<dyn PerfReporter>> =
            vec![Arc::new(FailingReporter), Arc::new(LoggingReporter)];
        report_all(&reporters, &Metadata::default(), &[]);
    }
}
