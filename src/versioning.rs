//! Experiment versioning
//!
//! ## Table of Contents
//! - **ExperimentVersioner**: Assigns versions and writes experiments to the object store
//! - **VersionedExperiment**: Committed version manifest
//! - **DataframeLocation**: Storage coordinates of one dataframe
//!
//! Layout: `{prefix}/{run}/v{major.minor.patch}/{key}.bin` plus a
//! `manifest.json` written last. A version counts as published only once its
//! manifest exists. Every write is create-if-absent, so concurrent publishers
//! of the same run cannot both claim a version.

use crate::aggregator::{AggregatedResult, IncompleteBranch};
use crate::error::{FanoutError, Result};
use crate::metrics::SharedMetrics;
use crate::storage::object::{join_path, BoxedObjectStore};
use crate::types::{RunName, SemVer, VersionBump};
use crate::worker::SpecFailure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Manifest object name inside a version prefix
pub const MANIFEST_FILE: &str = "manifest.json";

/// Extension of stored dataframes
pub const FRAME_EXTENSION: &str = "bin";

/// Storage coordinates of one dataframe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataframeLocation {
    /// Object path
    pub path: String,
    /// Row count
    pub rows: usize,
    /// Stored size
    pub bytes: usize,
}

/// A committed, immutable experiment version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedExperiment {
    /// Run name
    pub run: RunName,
    /// Version
    pub version: SemVer,
    /// Dataframes by key
    pub dataframes: BTreeMap<String, DataframeLocation>,
    /// Publish time
    pub published_at: DateTime<Utc>,
    /// Spec failures carried from aggregation
    #[serde(default)]
    pub failures: Vec<SpecFailure>,
    /// Branches that did not contribute
    #[serde(default)]
    pub incomplete_branches: Vec<IncompleteBranch>,
}

impl VersionedExperiment {
    /// Dataframe keys in this version
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.dataframes.keys().map(String::as_str)
    }
}

/// Publishes aggregated results as versioned experiments
#[derive(Clone)]
pub struct ExperimentVersioner {
    store: BoxedObjectStore,
    prefix: String,
    metrics: Option<SharedMetrics>,
}

impl ExperimentVersioner {
    /// Create a versioner writing under `prefix`
    pub fn new(store: BoxedObjectStore, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            metrics: None,
        }
    }

    /// Attach metrics
    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Bucket prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Storage prefix of a run
    pub fn run_prefix(&self, run: &RunName) -> String {
        join_path([self.prefix.as_str(), run.as_str()])
    }

    /// Storage prefix of one version
    pub fn version_prefix(&self, run: &RunName, version: SemVer) -> String {
        let segment = version.path_segment();
        join_path([self.prefix.as_str(), run.as_str(), segment.as_str()])
    }

    /// Object path of a version's manifest
    pub fn manifest_path(&self, run: &RunName, version: SemVer) -> String {
        join_path([self.version_prefix(run, version).as_str(), MANIFEST_FILE])
    }

    /// Object path of one dataframe
    pub fn frame_path(&self, run: &RunName, version: SemVer, key: &str) -> String {
        let file = format!("{}.{}", key, FRAME_EXTENSION);
        join_path([self.version_prefix(run, version).as_str(), file.as_str()])
    }

    /// Version segments directly under the run, with whether each is committed
    async fn scan_versions(&self, run: &RunName) -> Result<BTreeMap<SemVer, bool>> {
        let run_prefix = format!("{}/", self.run_prefix(run));
        let mut versions = BTreeMap::new();
        for path in self.store.list(&run_prefix).await? {
            let rest = &path[run_prefix.len()..];
            let Some((segment, tail)) = rest.split_once('/') else {
                continue;
            };
            if let Some(version) = SemVer::from_path_segment(segment) {
                let committed = versions.entry(version).or_insert(false);
                *committed |= tail == MANIFEST_FILE;
            }
        }
        Ok(versions)
    }

    /// Committed versions of a run, ascending
    pub async fn list_versions(&self, run: &RunName) -> Result<Vec<SemVer>> {
        Ok(self
            .scan_versions(run)
            .await?
            .into_iter()
            .filter(|(_, committed)| *committed)
            .map(|(v, _)| v)
            .collect())
    }

    /// Highest committed version, if any
    pub async fn latest_version(&self, run: &RunName) -> Result<Option<SemVer>> {
        Ok(self.list_versions(run).await?.into_iter().max())
    }

    /// Version the next publish with `bump` would claim
    ///
    /// Any occupied version prefix counts, committed or not, so leftovers
    /// of an interrupted publish are never overwritten.
    pub async fn next_version(&self, run: &RunName, bump: VersionBump) -> Result<SemVer> {
        Ok(self
            .scan_versions(run)
            .await?
            .into_keys()
            .max()
            .map(|highest| highest.bump(bump))
            .unwrap_or(SemVer::INITIAL))
    }

    /// Publish with the default minor bump
    pub async fn publish(&self, run: &RunName, result: &AggregatedResult) -> Result<VersionedExperiment> {
        self.publish_with_bump(run, result, VersionBump::Minor).await
    }

    /// Publish, bumping the chosen component of the highest existing version
    ///
    /// The first publish of a run is always `1.0.0`. Fails with
    /// `VersionCollision` if a concurrent publisher claimed the version, and
    /// with `AggregationFailed` if no branch of the result completed.
    pub async fn publish_with_bump(
        &self,
        run: &RunName,
        result: &AggregatedResult,
        bump: VersionBump,
    ) -> Result<VersionedExperiment> {
        if let Some(owner) = &result.run {
            if owner != run {
                return Err(FanoutError::config(format!(
                    "result belongs to run {}, not {}",
                    owner, run
                )));
            }
        }

        if result.completed_branches == 0 {
            return Err(FanoutError::AggregationFailed {
                run: run.to_string(),
                branches: result.incomplete_branches.len(),
                reason: result
                    .incomplete_branches
                    .first()
                    .map(|b| b.reason.clone())
                    .unwrap_or_else(|| "result holds no branches".to_string()),
            });
        }

        let version = self.next_version(run, bump).await?;
        let mut dataframes = BTreeMap::new();

        for (key, frame) in &result.frames {
            let path = self.frame_path(run, version, key);
            let bytes = frame.to_binary()?;
            let size = bytes.len();
            self.store.write_object(&path, bytes.into()).await?;
            debug!(run = %run, version = %version, key = %key, rows = frame.len(), "Dataframe written");
            dataframes.insert(
                key.clone(),
                DataframeLocation {
                    path,
                    rows: frame.len(),
                    bytes: size,
                },
            );
        }

        let experiment = VersionedExperiment {
            run: run.clone(),
            version,
            dataframes,
            published_at: Utc::now(),
            failures: result.failures.clone(),
            incomplete_branches: result.incomplete_branches.clone(),
        };
        let manifest = serde_json::to_vec_pretty(&experiment)?;
        self.store
            .write_object(&self.manifest_path(run, version), manifest.into())
            .await?;

        if let Some(metrics) = &self.metrics {
            metrics.record_publish();
        }
        info!(
            run = %run,
            version = %version,
            dataframes = experiment.dataframes.len(),
            incomplete = experiment.incomplete_branches.len(),
            "Experiment published"
        );
        Ok(experiment)
    }

    /// Load a committed version's manifest, `NotFound` if absent
    pub async fn load(&self, run: &RunName, version: SemVer) -> Result<VersionedExperiment> {
        let bytes = self
            .store
            .read_object(&self.manifest_path(run, version))
            .await
            .map_err(|e| match e {
                FanoutError::NotFound(_) => {
                    FanoutError::not_found(format!("run {} version {}", run, version))
                }
                other => other,
            })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Load the latest committed version, `NotFound` if the run has none
    pub async fn load_latest(&self, run: &RunName) -> Result<VersionedExperiment> {
        let version = self
            .latest_version(run)
            .await?
            .ok_or_else(|| FanoutError::not_found(format!("run {} has no published versions", run)))?;
        self.load(run, version).await
    }

    /// Every run under `scope` (or the whole prefix) with its committed versions
    pub async fn list_experiments(&self, scope: Option<&str>) -> Result<BTreeMap<RunName, Vec<SemVer>>> {
        let base = join_path([self.prefix.as_str(), scope.unwrap_or("")]);
        let listing_prefix = if base.is_empty() { base } else { format!("{}/", base) };
        let root_len = match join_path([self.prefix.as_str()]) {
            p if p.is_empty() => 0,
            p => p.len() + 1,
        };

        let mut runs: BTreeMap<RunName, BTreeSet<SemVer>> = BTreeMap::new();
        for path in self.store.list(&listing_prefix).await? {
            let Some(rest) = path.get(root_len..) else {
                continue;
            };
            let Some(run_and_version) = rest.strip_suffix(&format!("/{}", MANIFEST_FILE)) else {
                continue;
            };
            let Some((run, segment)) = run_and_version.rsplit_once('/') else {
                continue;
            };
            if let (Ok(run), Some(version)) = (RunName::new(run), SemVer::from_path_segment(segment)) {
                runs.entry(run).or_default().insert(version);
            }
        }
        Ok(runs
            .into_iter()
            .map(|(run, versions)| (run, versions.into_iter().collect()))
            .collect())
    }
}
