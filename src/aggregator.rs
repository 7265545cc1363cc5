//! Result aggregation
//!
//! ## Table of Contents
//! - **PollConfig**: Poll interval backoff bounds
//! - **ResultAggregator**: Polls tasks to completion and merges partial results
//! - **AggregatedResult**: Union of partial results plus incomplete branches
//! - **IncompleteBranch**: Branch missing from the union, with the reason
//!
//! Polling ends when every task is terminal, the run timeout elapses, or
//! cancellation is raised. Whatever completed by then is merged; the rest is
//! reported as incomplete. A run where no branch completed fails:
//! `AggregationTimeout` if polling was cut short, `AggregationFailed` if
//! every branch ended without a result.

use crate::backend::BoxedBackend;
use crate::error::{FanoutError, Result};
use crate::frame::{keys, DataFrame};
use crate::job::{Task, TaskStatus};
use crate::ledger::TaskLedger;
use crate::metrics::SharedMetrics;
use crate::resilience::{CancelSignal, ExponentialBackoff, RetryConfig};
use crate::types::{RunName, SpecId};
use crate::worker::{PartialResult, SpecFailure};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Poll interval bounds
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// First interval
    pub initial_interval: Duration,
    /// Interval cap
    pub max_interval: Duration,
    /// Growth factor
    pub multiplier: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(60),
            multiplier: 1.5,
        }
    }
}

impl PollConfig {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            RetryConfig::new()
                .initial_delay(self.initial_interval)
                .max_delay(self.max_interval)
                .multiplier(self.multiplier)
                .jitter(false),
        )
    }
}

/// A branch absent from the aggregated result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompleteBranch {
    /// Branch index
    pub branch_index: usize,
    /// Specs that produced no rows because of it
    pub spec_count: usize,
    /// Why the branch is missing
    pub reason: String,
}

/// Merged output of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    /// Run name
    pub run: Option<RunName>,
    /// Frames by dataframe key
    pub frames: BTreeMap<String, DataFrame>,
    /// Per-spec failures across all completed branches
    pub failures: Vec<SpecFailure>,
    /// Branches with no result, ordered by index
    pub incomplete_branches: Vec<IncompleteBranch>,
    /// Number of branches merged
    pub completed_branches: usize,
}

impl AggregatedResult {
    /// Summary rows in the `EnergyAndPeak` frame
    pub fn summary_rows(&self) -> usize {
        self.frames
            .get(keys::ENERGY_AND_PEAK)
            .map(DataFrame::len)
            .unwrap_or(0)
    }

    /// Whether every branch contributed
    pub fn is_complete(&self) -> bool {
        self.incomplete_branches.is_empty()
    }

    /// Indices of incomplete branches
    pub fn incomplete_indices(&self) -> Vec<usize> {
        self.incomplete_branches.iter().map(|b| b.branch_index).collect()
    }

    /// Merge partial results in the given order
    ///
    /// Rows are concatenated per dataframe key without deduplication, over
    /// the union of every branch's columns. A spec id appearing in more than
    /// one branch is a `DataIntegrity` error.
    pub fn merge(run: &RunName, partials: Vec<PartialResult>) -> Result<Self> {
        let mut merged = Self {
            run: Some(run.clone()),
            ..Default::default()
        };
        let mut owners: HashMap<SpecId, usize> = HashMap::new();

        for partial in partials {
            let branch = partial.branch_index;
            for frame in partial.frames.values() {
                for key in frame.distinct_keys() {
                    match owners.get(&key) {
                        Some(&owner) if owner != branch => {
                            return Err(FanoutError::integrity(format!(
                                "spec {} produced rows in branches {} and {}",
                                key, owner, branch
                            )));
                        }
                        _ => {
                            owners.insert(key, branch);
                        }
                    }
                }
            }
            for (key, frame) in partial.frames {
                merged.frames.entry(key).or_default().concat(frame);
            }
            merged.failures.extend(partial.failures);
            merged.completed_branches += 1;
        }
        Ok(merged)
    }
}

enum Resolution {
    Completed(PartialResult),
    Missing(String),
}

/// Polls tasks and merges their results
#[derive(Clone)]
pub struct ResultAggregator {
    backend: BoxedBackend,
    ledger: Option<TaskLedger>,
    poll: PollConfig,
    run_timeout: Duration,
    metrics: Option<SharedMetrics>,
}

impl ResultAggregator {
    /// Create an aggregator with a run-level timeout
    pub fn new(backend: BoxedBackend, run_timeout: Duration) -> Self {
        Self {
            backend,
            ledger: None,
            poll: PollConfig::default(),
            run_timeout,
            metrics: None,
        }
    }

    /// Record terminal statuses in the ledger
    pub fn with_ledger(mut self, ledger: TaskLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Set poll interval bounds
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Attach metrics
    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Poll every task to a terminal state and merge the results
    ///
    /// Fails when no branch completed: `AggregationTimeout` if the timeout
    /// or cancellation interrupted polling, `AggregationFailed` otherwise.
    pub async fn aggregate(
        &self,
        run: &RunName,
        tasks: &[Task],
        cancel: &CancelSignal,
    ) -> Result<AggregatedResult> {
        let mut indices = HashSet::with_capacity(tasks.len());
        if let Some(dup) = tasks.iter().find(|t| !indices.insert(t.branch_index)) {
            return Err(FanoutError::config(format!(
                "branch {} of run {} is listed more than once",
                dup.branch_index, run
            )));
        }

        let started = Instant::now();
        let deadline = started + self.run_timeout;
        if let Some(metrics) = &self.metrics {
            metrics.active_runs.inc();
        }

        let mut resolved: BTreeMap<usize, Resolution> = BTreeMap::new();
        for task in tasks.iter().filter(|t| t.handle.is_none()) {
            let reason = task
                .failure
                .clone()
                .unwrap_or_else(|| "never submitted".to_string());
            resolved.insert(task.branch_index, Resolution::Missing(reason));
        }

        let mut backoff = self.poll.backoff();
        let mut interrupted = None;
        loop {
            for task in tasks {
                if resolved.contains_key(&task.branch_index) {
                    continue;
                }
                match self.poll_task(task).await {
                    Ok(Some(resolution)) => {
                        resolved.insert(task.branch_index, resolution);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        if let Some(metrics) = &self.metrics {
                            metrics.active_runs.dec();
                        }
                        return Err(e);
                    }
                }
            }

            let outstanding = tasks.len() - resolved.len();
            if outstanding == 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                interrupted = Some(format!(
                    "timed out after {}s",
                    self.run_timeout.as_secs()
                ));
                break;
            }

            let wait = backoff.next_interval().min(deadline - now);
            debug!(run = %run, outstanding, wait_ms = wait.as_millis() as u64, "Waiting for tasks");
            if !cancel.sleep(wait).await {
                interrupted = Some("cancelled".to_string());
                break;
            }
        }

        let mut partials = Vec::new();
        let mut incomplete = Vec::new();
        for task in tasks {
            match resolved.remove(&task.branch_index) {
                Some(Resolution::Completed(partial)) => partials.push(partial),
                Some(Resolution::Missing(reason)) => incomplete.push(IncompleteBranch {
                    branch_index: task.branch_index,
                    spec_count: task.spec_count,
                    reason,
                }),
                None => incomplete.push(IncompleteBranch {
                    branch_index: task.branch_index,
                    spec_count: task.spec_count,
                    reason: interrupted
                        .clone()
                        .unwrap_or_else(|| "not terminal".to_string()),
                }),
            }
        }
        partials.sort_by_key(|p| p.branch_index);
        incomplete.sort_by_key(|b| b.branch_index);

        if let Some(metrics) = &self.metrics {
            metrics.active_runs.dec();
        }

        if partials.is_empty() {
            error!(
                run = %run,
                tasks = tasks.len(),
                interrupted = interrupted.as_deref().unwrap_or("no"),
                "No branch completed"
            );
            if interrupted.is_some() {
                return Err(FanoutError::AggregationTimeout {
                    run: run.to_string(),
                    timeout_secs: self.run_timeout.as_secs(),
                });
            }
            return Err(FanoutError::AggregationFailed {
                run: run.to_string(),
                branches: tasks.len(),
                reason: incomplete
                    .first()
                    .map(|b| b.reason.clone())
                    .unwrap_or_else(|| "no tasks".to_string()),
            });
        }

        let mut result = AggregatedResult::merge(run, partials)?;
        for branch in &incomplete {
            warn!(run = %run, branch = branch.branch_index, reason = %branch.reason, "Branch incomplete");
        }
        result.incomplete_branches = incomplete;

        if let Some(metrics) = &self.metrics {
            metrics.record_aggregation(started.elapsed().as_secs_f64(), result.summary_rows());
        }
        info!(
            run = %run,
            completed = result.completed_branches,
            incomplete = result.incomplete_branches.len(),
            rows = result.summary_rows(),
            failures = result.failures.len(),
            "Aggregation finished"
        );
        Ok(result)
    }

    /// Poll one task; `None` while it is still in flight
    async fn poll_task(&self, task: &Task) -> Result<Option<Resolution>> {
        let Some(handle) = &task.handle else {
            return Ok(None);
        };

        let status = match self.backend.status(handle).await {
            Ok(status) => status,
            Err(e) if e.is_transient() => {
                debug!(handle = %handle, error = %e, "Status poll failed, will retry");
                return Ok(None);
            }
            Err(e) => {
                return self
                    .finish(task, TaskStatus::Failed, Resolution::Missing(format!("status unavailable: {}", e)))
                    .await;
            }
        };

        match status {
            TaskStatus::Pending | TaskStatus::Running => Ok(None),
            TaskStatus::Completed => match self.backend.result(handle).await {
                Ok(partial) => self.finish(task, status, Resolution::Completed(partial)).await,
                Err(e) if e.is_transient() => {
                    debug!(handle = %handle, error = %e, "Result not readable yet");
                    Ok(None)
                }
                Err(e) => {
                    self.finish(task, TaskStatus::Failed, Resolution::Missing(format!("result fetch failed: {}", e)))
                        .await
                }
            },
            TaskStatus::Failed => {
                let reason = match self.backend.result(handle).await {
                    Err(e) => e.to_string(),
                    Ok(_) => "task failed".to_string(),
                };
                self.finish(task, status, Resolution::Missing(reason)).await
            }
        }
    }

    async fn finish(
        &self,
        task: &Task,
        status: TaskStatus,
        resolution: Resolution,
    ) -> Result<Option<Resolution>> {
        if let Some(metrics) = &self.metrics {
            metrics.record_task(status);
        }
        if let Some(ledger) = &self.ledger {
            let mut record = task.clone();
            record.status = status;
            record.failure = match &resolution {
                Resolution::Missing(reason) => Some(reason.clone()),
                Resolution::Completed(_) => None,
            };
            ledger.upsert(&record).await?;
        }
        Ok(Some(resolution))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockOrchestrationBackend;
    use crate::error::BackendError;
    use crate::frame::Row;
    use crate::job::TaskHandle;
    use crate::planner::Branch;
    use crate::storage::memory_store;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn run() -> RunName {
        RunName::new("city/base").unwrap()
    }

    fn task(index: usize) -> Task {
        let branch = Branch {
            run: run(),
            index,
            specs: Vec::new(),
            payload_bytes: 0,
        };
        let mut task = Task::accepted(&branch, TaskHandle::new(format!("h-{}", index)), 1);
        task.spec_count = 2;
        task
    }

    fn partial(index: usize, ids: &[&str]) -> PartialResult {
        let mut frame = DataFrame::new(vec!["feature.weather.file".to_string()], vec!["Energy.Heating.Annual".to_string()]);
        for id in ids {
            frame
                .push(Row::new(*id, vec!["PRT_Lisboa".to_string()], vec![42.0]))
                .unwrap();
        }
        PartialResult {
            run: Some(run()),
            branch_index: index,
            submission: "s1".to_string(),
            frames: BTreeMap::from([(keys::ENERGY_AND_PEAK.to_string(), frame)]),
            failures: Vec::new(),
            worker: "test".to_string(),
        }
    }

    fn fast_poll() -> PollConfig {
        PollConfig {
            initial_interval: Duration::from_millis(2),
            max_interval: Duration::from_millis(10),
            multiplier: 2.0,
        }
    }

    fn index_of(handle: &TaskHandle) -> usize {
        handle.as_str().trim_start_matches("h-").parse().unwrap()
    }

    #[tokio::test]
    async fn test_failed_branch_reported_incomplete() {
        let mut backend = MockOrchestrationBackend::new();
        backend.expect_status().returning(|h| {
            Ok(if index_of(h) == 1 {
                TaskStatus::Failed
            } else {
                TaskStatus::Completed
            })
        });
        backend.expect_result().returning(|h| match index_of(h) {
            1 => Err(BackendError::permanent("allocation lost")),
            i => {
                let (a, b) = (format!("b-{}-a", i), format!("b-{}-b", i));
                Ok(partial(i, &[a.as_str(), b.as_str()]))
            }
        });

        let ledger = TaskLedger::new(memory_store());
        let aggregator = ResultAggregator::new(Arc::new(backend), Duration::from_secs(5))
            .with_poll(fast_poll())
            .with_ledger(ledger.clone());
        let tasks: Vec<Task> = (0..3).map(task).collect();

        let result = aggregator
            .aggregate(&run(), &tasks, &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(result.summary_rows(), 4);
        assert_eq!(result.completed_branches, 2);
        assert_eq!(result.incomplete_indices(), vec![1]);
        assert!(result.incomplete_branches[0].reason.contains("allocation lost"));
        assert_eq!(result.incomplete_branches[0].spec_count, 2);

        let recorded = ledger.get(&run(), 1).await.unwrap().unwrap();
        assert_eq!(recorded.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_polls_until_completion() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);

        let mut backend = MockOrchestrationBackend::new();
        backend.expect_status().returning(move |_| match counter.fetch_add(1, Ordering::SeqCst) {
            0 => Ok(TaskStatus::Pending),
            1 => Err(BackendError::transient("connection reset")),
            2 => Ok(TaskStatus::Running),
            _ => Ok(TaskStatus::Completed),
        });
        backend
            .expect_result()
            .times(1)
            .returning(|_| Ok(partial(0, &["a"])));

        let aggregator =
            ResultAggregator::new(Arc::new(backend), Duration::from_secs(5)).with_poll(fast_poll());
        let result = aggregator
            .aggregate(&run(), &[task(0)], &CancelSignal::never())
            .await
            .unwrap();

        assert!(result.is_complete());
        assert_eq!(result.summary_rows(), 1);
        assert_eq!(polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_timeout_with_no_completion_fails() {
        let mut backend = MockOrchestrationBackend::new();
        backend.expect_status().returning(|_| Ok(TaskStatus::Running));

        let aggregator =
            ResultAggregator::new(Arc::new(backend), Duration::from_millis(50)).with_poll(fast_poll());
        let err = aggregator
            .aggregate(&run(), &[task(0), task(1)], &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, FanoutError::AggregationTimeout { .. }));
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_results() {
        let mut backend = MockOrchestrationBackend::new();
        backend.expect_status().returning(|h| {
            Ok(if index_of(h) == 0 {
                TaskStatus::Completed
            } else {
                TaskStatus::Running
            })
        });
        backend.expect_result().returning(|_| Ok(partial(0, &["a", "b"])));

        let aggregator =
            ResultAggregator::new(Arc::new(backend), Duration::from_millis(50)).with_poll(fast_poll());
        let result = aggregator
            .aggregate(&run(), &[task(0), task(1)], &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(result.summary_rows(), 2);
        assert_eq!(result.incomplete_indices(), vec![1]);
        assert!(result.incomplete_branches[0].reason.contains("timed out"));
    }

    #[tokio::test]
    async fn test_unsubmitted_task_not_polled() {
        let mut backend = MockOrchestrationBackend::new();
        backend
            .expect_status()
            .times(1)
            .returning(|_| Ok(TaskStatus::Completed));
        backend.expect_result().returning(|_| Ok(partial(0, &["a"])));

        let branch = Branch {
            run: run(),
            index: 1,
            specs: Vec::new(),
            payload_bytes: 0,
        };
        let failed = Task::submission_failed(&branch, "submission failed for branch 1: 503", 4);

        let aggregator =
            ResultAggregator::new(Arc::new(backend), Duration::from_secs(5)).with_poll(fast_poll());
        let result = aggregator
            .aggregate(&run(), &[task(0), failed], &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(result.incomplete_indices(), vec![1]);
        assert!(result.incomplete_branches[0].reason.contains("503"));
    }

    #[tokio::test]
    async fn test_every_branch_failed_is_an_error() {
        let mut backend = MockOrchestrationBackend::new();
        backend.expect_status().returning(|_| Ok(TaskStatus::Failed));
        backend
            .expect_result()
            .returning(|_| Err(BackendError::permanent("worker crashed: engine process died")));

        let aggregator =
            ResultAggregator::new(Arc::new(backend), Duration::from_secs(5)).with_poll(fast_poll());
        let err = aggregator
            .aggregate(&run(), &[task(0), task(1)], &CancelSignal::never())
            .await
            .unwrap_err();
        match err {
            FanoutError::AggregationFailed { branches, reason, .. } => {
                assert_eq!(branches, 2);
                assert!(reason.contains("worker crashed"));
            }
            other => panic!("expected AggregationFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_branch_index_rejected() {
        let aggregator = ResultAggregator::new(
            Arc::new(MockOrchestrationBackend::new()),
            Duration::from_secs(5),
        )
        .with_poll(fast_poll());
        let err = aggregator
            .aggregate(&run(), &[task(0), task(1), task(1)], &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, FanoutError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_merge_unions_branch_columns() {
        let mut aged = partial(1, &["c"]);
        let frame = aged.frames.get_mut(keys::ENERGY_AND_PEAK).unwrap();
        frame.index_columns.push("feature.semantic.Age".to_string());
        frame.rows[0].index.push("1975".to_string());

        let merged = AggregatedResult::merge(&run(), vec![partial(0, &["a", "b"]), aged]).unwrap();
        let summary = &merged.frames[keys::ENERGY_AND_PEAK];
        assert_eq!(summary.len(), 3);
        assert_eq!(summary.index_columns.len(), 2);
        let ages: Vec<_> = summary.rows.iter().map(|r| r.index[1].as_str()).collect();
        assert_eq!(ages, vec!["", "", "1975"]);
    }

    #[test]
    fn test_merge_rejects_key_collision() {
        let err = AggregatedResult::merge(&run(), vec![partial(0, &["a", "b"]), partial(1, &["b"])])
            .unwrap_err();
        assert!(matches!(err, FanoutError::DataIntegrity(_)));
    }

    #[test]
    fn test_merge_concatenates_in_branch_order() {
        let merged =
            AggregatedResult::merge(&run(), vec![partial(0, &["a", "b"]), partial(1, &["c"])]).unwrap();
        let keys: Vec<_> = merged.frames[keys::ENERGY_AND_PEAK]
            .rows
            .iter()
            .map(|r| r.key.as_str().to_string())
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(merged.completed_branches, 2);
    }
}
