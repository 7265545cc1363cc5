//! Branch submission
//!
//! Serializes each branch into a [`TaskDescriptor`] and hands it to the
//! orchestration backend. Transient backend failures are retried with
//! exponential backoff; a branch that still cannot be submitted is recorded
//! as failed and the others carry on. Accepted tasks are written to the
//! [`TaskLedger`] as they resolve, so a rerun skips them.
//!
//! Every task carries a submission id. A resumed run keeps the id found in
//! the ledger; a run with no ledger records starts a new one, so its tasks
//! and uploads never alias an earlier submission's.

use crate::backend::BoxedBackend;
use crate::error::{FanoutError, Result};
use crate::job::{new_submission_id, Task, TaskDescriptor};
use crate::ledger::TaskLedger;
use crate::metrics::SharedMetrics;
use crate::planner::Branch;
use crate::resilience::{CancelSignal, RetryConfig, RetryOutcome, RetryPolicy};
use crate::spec::HourlyDataConfig;
use crate::types::RunName;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Default number of in-flight submissions
pub const DEFAULT_SUBMIT_CONCURRENCY: usize = 16;

/// Submits branches to a backend and records them in the ledger
#[derive(Clone)]
pub struct JobSubmitter {
    backend: BoxedBackend,
    ledger: TaskLedger,
    retry: RetryPolicy,
    concurrency: usize,
    metrics: Option<SharedMetrics>,
}

impl JobSubmitter {
    /// Create a submitter
    pub fn new(backend: BoxedBackend, ledger: TaskLedger) -> Self {
        Self {
            backend,
            ledger,
            retry: RetryPolicy::default_config(),
            concurrency: DEFAULT_SUBMIT_CONCURRENCY,
            metrics: None,
        }
    }

    /// Set the retry policy for transient failures
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = RetryPolicy::new(config);
        self
    }

    /// Set how many submissions may be in flight
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Attach metrics
    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Submit every branch of a run
    ///
    /// Returns the submission id and one task per branch, ordered by branch
    /// index, once every submission has resolved. Branches already accepted according to the
    /// ledger are not resubmitted. Only ledger failures and foreign branches
    /// abort the call.
    pub async fn submit(
        &self,
        run: &RunName,
        branches: Vec<Branch>,
        hourly: &HourlyDataConfig,
        cancel: &CancelSignal,
    ) -> Result<(String, Vec<Task>)> {
        if let Some(foreign) = branches.iter().find(|b| &b.run != run) {
            return Err(FanoutError::config(format!(
                "branch {} belongs to run {}, not {}",
                foreign.index, foreign.run, run
            )));
        }

        let recorded = self.ledger.list_run(run).await?;
        let submission = recorded
            .iter()
            .map(|t| t.submission.as_str())
            .find(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(new_submission_id);
        let mut known: HashMap<usize, Task> = recorded
            .into_iter()
            .filter(|t| t.is_submitted() && t.submission == submission)
            .map(|t| (t.branch_index, t))
            .collect();

        let total = branches.len();
        let mut tasks = Vec::with_capacity(total);
        let mut pending = Vec::new();
        for branch in branches {
            match known.remove(&branch.index) {
                Some(task) => {
                    debug!(run = %run, branch = branch.index, "Branch already accepted, skipping");
                    tasks.push(task);
                }
                None => pending.push(branch),
            }
        }
        let resumed = tasks.len();

        let submitted: Vec<Task> = stream::iter(pending)
            .map(|branch| self.submit_branch(branch, hourly, &submission, cancel))
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;
        tasks.extend(submitted);
        tasks.sort_by_key(|t| t.branch_index);

        let failed = tasks.iter().filter(|t| !t.is_submitted()).count();
        info!(
            run = %run,
            submission = %submission,
            branches = total,
            resumed,
            failed,
            "Submission finished"
        );
        Ok((submission, tasks))
    }

    async fn submit_branch(
        &self,
        branch: Branch,
        hourly: &HourlyDataConfig,
        submission: &str,
        cancel: &CancelSignal,
    ) -> Result<Task> {
        let descriptor = TaskDescriptor::new(branch, hourly.clone(), submission);
        let backend = &self.backend;

        let outcome = self
            .retry
            .execute_if(
                || backend.submit(&descriptor),
                |e| e.is_transient(),
                cancel,
            )
            .await;
        let attempts = outcome.attempts();
        let branch = &descriptor.branch;

        let task = match outcome {
            RetryOutcome::Succeeded { value, .. } => {
                debug!(run = %branch.run, branch = branch.index, handle = %value, attempts, "Branch accepted");
                Task::accepted(branch, value, attempts)
            }
            RetryOutcome::Exhausted { error, .. } | RetryOutcome::Rejected { error, .. } => {
                let failure = FanoutError::SubmissionFailure {
                    branch: branch.index,
                    reason: error.to_string(),
                };
                warn!(run = %branch.run, branch = branch.index, attempts, error = %failure, "Branch submission failed");
                Task::submission_failed(branch, failure.to_string(), attempts)
            }
            RetryOutcome::Cancelled { .. } => {
                warn!(run = %branch.run, branch = branch.index, "Submission cancelled");
                Task::submission_failed(branch, FanoutError::Cancelled.to_string(), attempts)
            }
        }
        .with_submission(submission);

        if let Some(metrics) = &self.metrics {
            metrics.record_submission(task.is_submitted(), attempts);
        }
        self.ledger.upsert(&task).await?;
        Ok(task)
    }
}
