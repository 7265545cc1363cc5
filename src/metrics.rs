//! Prometheus metrics for fan-out runs
//!
//! ## Table of Contents
//! - **FanoutMetrics**: Registry plus the counters and histograms for one process

use crate::error::{FanoutError, Result};
use crate::job::TaskStatus;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Arc;

/// Core metrics for the fan-out pipeline
pub struct FanoutMetrics {
    registry: Registry,

    // Planning and submission
    pub branches_planned: IntCounter,
    pub submissions: IntCounterVec,
    pub submission_retries: IntCounter,

    // Execution
    pub tasks_finished: IntCounterVec,
    pub spec_failures: IntCounterVec,
    pub active_runs: IntGauge,

    // Aggregation and publishing
    pub aggregation_duration: Histogram,
    pub rows_aggregated: IntCounter,
    pub publishes: IntCounter,
}

impl FanoutMetrics {
    /// Create a new metrics instance with its own registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let branches_planned =
            IntCounter::new("fanout_branches_planned_total", "Total branches planned")?;
        let submissions = IntCounterVec::new(
            Opts::new("fanout_submissions_total", "Branch submissions by result"),
            &["result"],
        )?;
        let submission_retries = IntCounter::new(
            "fanout_submission_retries_total",
            "Submission attempts beyond the first",
        )?;

        let tasks_finished = IntCounterVec::new(
            Opts::new("fanout_tasks_finished_total", "Tasks reaching a terminal status"),
            &["status"],
        )?;
        let spec_failures = IntCounterVec::new(
            Opts::new("fanout_spec_failures_total", "Per-spec simulation failures"),
            &["kind"],
        )?;
        let active_runs = IntGauge::new("fanout_active_runs", "Runs currently aggregating")?;

        let aggregation_duration = Histogram::with_opts(
            HistogramOpts::new("fanout_aggregation_duration_seconds", "Time to aggregate a run")
                .buckets(vec![1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]),
        )?;
        let rows_aggregated =
            IntCounter::new("fanout_rows_aggregated_total", "Summary rows merged")?;
        let publishes = IntCounter::new("fanout_publishes_total", "Experiment versions published")?;

        registry.register(Box::new(branches_planned.clone()))?;
        registry.register(Box::new(submissions.clone()))?;
        registry.register(Box::new(submission_retries.clone()))?;
        registry.register(Box::new(tasks_finished.clone()))?;
        registry.register(Box::new(spec_failures.clone()))?;
        registry.register(Box::new(active_runs.clone()))?;
        registry.register(Box::new(aggregation_duration.clone()))?;
        registry.register(Box::new(rows_aggregated.clone()))?;
        registry.register(Box::new(publishes.clone()))?;

        Ok(Self {
            registry,
            branches_planned,
            submissions,
            submission_retries,
            tasks_finished,
            spec_failures,
            active_runs,
            aggregation_duration,
            rows_aggregated,
            publishes,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a planned run
    pub fn record_planned(&self, branches: usize) {
        self.branches_planned.inc_by(branches as u64);
    }

    /// Record one branch submission outcome
    pub fn record_submission(&self, accepted: bool, attempts: u32) {
        let result = if accepted { "accepted" } else { "failed" };
        self.submissions.with_label_values(&[result]).inc();
        self.submission_retries
            .inc_by(u64::from(attempts.saturating_sub(1)));
    }

    /// Record a task reaching a terminal status
    pub fn record_task(&self, status: TaskStatus) {
        self.tasks_finished
            .with_label_values(&[&status.to_string()])
            .inc();
    }

    /// Record a per-spec failure
    pub fn record_spec_failure(&self, kind: &str) {
        self.spec_failures.with_label_values(&[kind]).inc();
    }

    /// Record a finished aggregation
    pub fn record_aggregation(&self, duration_secs: f64, rows: usize) {
        self.aggregation_duration.observe(duration_secs);
        self.rows_aggregated.inc_by(rows as u64);
    }

    /// Record a published version
    pub fn record_publish(&self) {
        self.publishes.inc();
    }

    /// Gather all metrics as text
    pub fn gather_text(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| FanoutError::metrics(format!("encode error: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| FanoutError::metrics(format!("utf8 error: {}", e)))
    }
}

/// Shared metrics handle
pub type SharedMetrics = Arc<FanoutMetrics>;
