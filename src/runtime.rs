//! Fanout runtime
//!
//! ## Table of Contents
//! - **Fanout**: Wires planner, submitter, aggregator, versioner and fetcher
//! - **SubmittedRun**: What a manifest submission hands back
//!
//! A run goes through `submit_manifest` (plan + submit, returns immediately),
//! then `collect_and_publish` (poll, merge, version). Both steps can be
//! repeated: the ledger makes submission resumable and every publish claims
//! a fresh version.

use crate::aggregator::{AggregatedResult, ResultAggregator};
use crate::backend::nomad::run_dispatched;
use crate::backend::BoxedBackend;
use crate::builder::{worker_runner, FanoutConfig};
use crate::error::{FanoutError, Result};
use crate::fetcher::{FetchRequest, ResultFetcher};
use crate::job::Task;
use crate::ledger::TaskLedger;
use crate::metrics::SharedMetrics;
use crate::planner::{Branch, BranchPlanner};
use crate::resilience::CancelSignal;
use crate::spec::{ExperimentSpec, HourlyDataConfig};
use crate::storage::{BoxedObjectStore, BoxedStateStore};
use crate::submitter::JobSubmitter;
use crate::types::{RunName, SemVer, VersionBump};
use crate::versioning::{ExperimentVersioner, VersionedExperiment};
use crate::worker::BoxedEngine;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Outcome of submitting a manifest
#[derive(Debug, Clone, Serialize)]
pub struct SubmittedRun {
    /// Run name
    pub run: RunName,
    /// Submission id shared by every task of this submission
    pub submission: String,
    /// One task per branch, by branch index
    pub tasks: Vec<Task>,
    /// Version the next minor publish would claim
    pub next_version: SemVer,
}

impl SubmittedRun {
    /// Branches the backend accepted
    pub fn accepted(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_submitted()).count()
    }

    /// Branches that could not be submitted
    pub fn failed(&self) -> usize {
        self.tasks.len() - self.accepted()
    }
}

/// Main Fanout runtime
pub struct Fanout {
    config: FanoutConfig,
    backend: BoxedBackend,
    state_store: BoxedStateStore,
    object_store: BoxedObjectStore,
    engine: Option<BoxedEngine>,
    metrics: Option<SharedMetrics>,

    ledger: TaskLedger,
    planner: BranchPlanner,
    submitter: JobSubmitter,
    aggregator: ResultAggregator,
    versioner: ExperimentVersioner,
    fetcher: ResultFetcher,
}

impl Fanout {
    /// Create a new Fanout instance (use FanoutBuilder instead)
    pub(crate) fn new(
        config: FanoutConfig,
        backend: BoxedBackend,
        state_store: BoxedStateStore,
        object_store: BoxedObjectStore,
        engine: Option<BoxedEngine>,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        let ledger = TaskLedger::new(state_store.clone());

        let mut planner = BranchPlanner::new();
        if let Some(max) = config.max_specs {
            planner = planner.with_max_specs(max);
        }

        let mut submitter = JobSubmitter::new(backend.clone(), ledger.clone())
            .with_retry(config.retry.clone())
            .with_concurrency(config.submit_concurrency);
        let mut aggregator = ResultAggregator::new(backend.clone(), config.run_timeout)
            .with_ledger(ledger.clone())
            .with_poll(config.poll.clone());
        let mut versioner = ExperimentVersioner::new(object_store.clone(), config.bucket_prefix.clone());
        if let Some(metrics) = &metrics {
            submitter = submitter.with_metrics(metrics.clone());
            aggregator = aggregator.with_metrics(metrics.clone());
            versioner = versioner.with_metrics(metrics.clone());
        }
        let fetcher = ResultFetcher::new(object_store.clone(), config.bucket_prefix.clone());

        Self {
            config,
            backend,
            state_store,
            object_store,
            engine,
            metrics,
            ledger,
            planner,
            submitter,
            aggregator,
            versioner,
            fetcher,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    /// Get the orchestration backend
    pub fn backend(&self) -> &BoxedBackend {
        &self.backend
    }

    /// Get the state store
    pub fn state_store(&self) -> &BoxedStateStore {
        &self.state_store
    }

    /// Get the object store
    pub fn object_store(&self) -> &BoxedObjectStore {
        &self.object_store
    }

    /// Get the task ledger
    pub fn ledger(&self) -> &TaskLedger {
        &self.ledger
    }

    /// Get the versioner
    pub fn versioner(&self) -> &ExperimentVersioner {
        &self.versioner
    }

    /// Get metrics instance
    pub fn metrics(&self) -> Option<&SharedMetrics> {
        self.metrics.as_ref()
    }

    /// Prometheus text exposition, empty when metrics are disabled
    pub fn gather_metrics(&self) -> Result<String> {
        match &self.metrics {
            Some(metrics) => metrics.gather_text(),
            None => Ok(String::new()),
        }
    }

    /// Hourly configuration of a manifest with the configured mode applied
    pub fn hourly_config(&self, manifest: &ExperimentSpec) -> HourlyDataConfig {
        let mut hourly = manifest.hourly();
        if let Some(mode) = self.config.hourly_output_mode {
            hourly.output_mode = mode;
        }
        hourly
    }

    /// Plan a manifest into branches
    pub fn plan(&self, manifest: &ExperimentSpec) -> Result<Vec<Branch>> {
        let run = manifest.run_name()?;
        let branches = self
            .planner
            .plan(&run, &manifest.buildings, self.config.max_branch_payload_bytes)?;
        if let Some(metrics) = &self.metrics {
            metrics.record_planned(branches.len());
        }
        Ok(branches)
    }

    /// Plan and submit a manifest, without waiting for completion
    ///
    /// Branches the ledger already shows as accepted are skipped, so
    /// resubmitting the same manifest resumes an interrupted submission.
    pub async fn submit_manifest(
        &self,
        manifest: &ExperimentSpec,
        cancel: &CancelSignal,
    ) -> Result<SubmittedRun> {
        let run = manifest.run_name()?;
        let branches = self.plan(manifest)?;
        let hourly = self.hourly_config(manifest);
        info!(
            run = %run,
            specs = manifest.buildings.len(),
            branches = branches.len(),
            backend = self.backend.name(),
            "Submitting manifest"
        );

        let (submission, tasks) = self.submitter.submit(&run, branches, &hourly, cancel).await?;
        let next_version = self.versioner.next_version(&run, VersionBump::Minor).await?;
        let submitted = SubmittedRun {
            run,
            submission,
            tasks,
            next_version,
        };
        if submitted.failed() > 0 {
            warn!(
                run = %submitted.run,
                failed = submitted.failed(),
                accepted = submitted.accepted(),
                "Some branches could not be submitted"
            );
        }
        Ok(submitted)
    }

    /// Alias of [`Fanout::submit_manifest`] for an interrupted run
    pub async fn resume(&self, manifest: &ExperimentSpec, cancel: &CancelSignal) -> Result<SubmittedRun> {
        self.submit_manifest(manifest, cancel).await
    }

    /// Poll the ledger's tasks for `run` and merge their results
    pub async fn collect(&self, run: &RunName, cancel: &CancelSignal) -> Result<AggregatedResult> {
        let tasks = self.ledger.list_run(run).await?;
        if tasks.is_empty() {
            return Err(FanoutError::not_found(format!("no submitted tasks for run {}", run)));
        }
        self.aggregator.aggregate(run, &tasks, cancel).await
    }

    /// Collect a run and publish it as the next version
    pub async fn collect_and_publish(
        &self,
        run: &RunName,
        bump: VersionBump,
        cancel: &CancelSignal,
    ) -> Result<VersionedExperiment> {
        let result = self.collect(run, cancel).await?;
        self.versioner.publish_with_bump(run, &result, bump).await
    }

    /// Submit, collect and publish a manifest end to end
    pub async fn run_manifest(
        &self,
        manifest: &ExperimentSpec,
        cancel: &CancelSignal,
    ) -> Result<VersionedExperiment> {
        let submitted = self.submit_manifest(manifest, cancel).await?;
        self.collect_and_publish(&submitted.run, VersionBump::Minor, cancel)
            .await
    }

    /// Forget the ledger entries of a run so it can be submitted afresh
    ///
    /// The next submission gets a new submission id, so none of the old
    /// tasks, staged descriptors or uploaded partial results are reused.
    pub async fn clear_run(&self, run: &RunName) -> Result<usize> {
        self.ledger.clear_run(run).await
    }

    /// Download a published experiment
    pub async fn fetch(
        &self,
        run: &RunName,
        version: Option<SemVer>,
        output_dir: impl AsRef<Path>,
    ) -> Result<Vec<PathBuf>> {
        self.fetcher.fetch(run, version, output_dir).await
    }

    /// Download according to a [`FetchRequest`]
    pub async fn fetch_request(
        &self,
        request: &FetchRequest,
        output_dir: impl AsRef<Path>,
    ) -> Result<Vec<PathBuf>> {
        self.fetcher.fetch_request(request, output_dir).await
    }

    /// Published runs under `scope` with their versions
    pub async fn list_experiments(&self, scope: Option<&str>) -> Result<BTreeMap<RunName, Vec<SemVer>>> {
        self.fetcher.list_experiments(scope).await
    }

    /// Worker side of a Nomad dispatch: run the payload and upload the result
    pub async fn run_dispatched(&self, payload: &[u8]) -> Result<String> {
        let engine = self
            .engine
            .clone()
            .ok_or_else(|| FanoutError::config("no simulation engine configured for this worker"))?;
        let runner = worker_runner(engine, &self.config, self.metrics.clone());
        run_dispatched(
            &runner,
            self.object_store.as_ref(),
            &self.config.bucket_prefix,
            payload,
        )
        .await
    }
}
