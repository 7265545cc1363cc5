//! Result retrieval
//!
//! ## Table of Contents
//! - **ResultFetcher**: Downloads a published experiment to a local directory
//! - **FetchRequest**: Run, optional version and optional dataframe key
//!
//! Files land in `{output_dir}/{run}/v{version}/` as `{key}.bin` (the stored
//! binary frame) and `{key}.csv`. Fetching never writes to the object store
//! and overwrites local files.

use crate::error::{FanoutError, Result};
use crate::frame::DataFrame;
use crate::storage::object::BoxedObjectStore;
use crate::types::{RunName, SemVer};
use crate::versioning::{ExperimentVersioner, VersionedExperiment, FRAME_EXTENSION};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// What to fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Run name
    pub run: RunName,
    /// Version, latest committed when absent
    pub version: Option<SemVer>,
    /// Single dataframe key, all when absent
    pub dataframe_key: Option<String>,
}

impl FetchRequest {
    /// Fetch every dataframe of the latest version
    pub fn latest(run: RunName) -> Self {
        Self {
            run,
            version: None,
            dataframe_key: None,
        }
    }

    /// Pin a version
    pub fn with_version(mut self, version: SemVer) -> Self {
        self.version = Some(version);
        self
    }

    /// Select one dataframe key
    pub fn with_dataframe_key(mut self, key: impl Into<String>) -> Self {
        self.dataframe_key = Some(key.into());
        self
    }
}

/// Downloads versioned experiments
#[derive(Clone)]
pub struct ResultFetcher {
    store: BoxedObjectStore,
    versioner: ExperimentVersioner,
}

impl ResultFetcher {
    /// Create a fetcher reading experiments under `prefix`
    pub fn new(store: BoxedObjectStore, prefix: impl Into<String>) -> Self {
        let versioner = ExperimentVersioner::new(store.clone(), prefix);
        Self { store, versioner }
    }

    /// Download every dataframe of `run` at `version` (latest if `None`)
    pub async fn fetch(
        &self,
        run: &RunName,
        version: Option<SemVer>,
        output_dir: impl AsRef<Path>,
    ) -> Result<Vec<PathBuf>> {
        let request = FetchRequest {
            run: run.clone(),
            version,
            dataframe_key: None,
        };
        self.fetch_request(&request, output_dir).await
    }

    /// Download according to a [`FetchRequest`]
    pub async fn fetch_request(
        &self,
        request: &FetchRequest,
        output_dir: impl AsRef<Path>,
    ) -> Result<Vec<PathBuf>> {
        let experiment = self.resolve(&request.run, request.version).await?;

        let selected: Vec<(&String, &str)> = match &request.dataframe_key {
            Some(key) => {
                let location = experiment.dataframes.get(key).ok_or_else(|| {
                    FanoutError::not_found(format!(
                        "dataframe '{}' in run {} version {}",
                        key, experiment.run, experiment.version
                    ))
                })?;
                vec![(key, location.path.as_str())]
            }
            None => experiment
                .dataframes
                .iter()
                .map(|(k, loc)| (k, loc.path.as_str()))
                .collect(),
        };

        let target = local_dir(output_dir.as_ref(), &experiment.run, experiment.version);
        tokio::fs::create_dir_all(&target).await?;

        let mut paths = Vec::with_capacity(selected.len() * 2);
        for (key, object_path) in selected {
            let bytes = self.store.read_object(object_path).await?;
            let frame = DataFrame::from_binary(&bytes)?;

            let bin_path = target.join(format!("{}.{}", key, FRAME_EXTENSION));
            tokio::fs::write(&bin_path, &bytes).await?;
            let csv_path = target.join(format!("{}.csv", key));
            tokio::fs::write(&csv_path, frame.to_csv()?).await?;

            debug!(run = %experiment.run, key = %key, rows = frame.len(), "Dataframe fetched");
            paths.push(bin_path);
            paths.push(csv_path);
        }

        info!(
            run = %experiment.run,
            version = %experiment.version,
            files = paths.len(),
            dir = %target.display(),
            "Experiment fetched"
        );
        Ok(paths)
    }

    /// Load one dataframe into memory without touching the filesystem
    pub async fn load_frame(
        &self,
        run: &RunName,
        version: Option<SemVer>,
        key: &str,
    ) -> Result<DataFrame> {
        let experiment = self.resolve(run, version).await?;
        let location = experiment.dataframes.get(key).ok_or_else(|| {
            FanoutError::not_found(format!(
                "dataframe '{}' in run {} version {}",
                key, run, experiment.version
            ))
        })?;
        let bytes = self.store.read_object(&location.path).await?;
        DataFrame::from_binary(&bytes)
    }

    /// Manifest of `run` at `version`, latest committed if `None`
    pub async fn resolve(&self, run: &RunName, version: Option<SemVer>) -> Result<VersionedExperiment> {
        match version {
            Some(version) => self.versioner.load(run, version).await,
            None => self.versioner.load_latest(run).await,
        }
    }

    /// Runs under `scope` with their committed versions
    pub async fn list_experiments(&self, scope: Option<&str>) -> Result<BTreeMap<RunName, Vec<SemVer>>> {
        self.versioner.list_experiments(scope).await
    }
}

/// Local directory for a fetched version
pub fn local_dir(output_dir: &Path, run: &RunName, version: SemVer) -> PathBuf {
    let mut dir = output_dir.to_path_buf();
    for segment in run.segments() {
        dir.push(segment);
    }
    dir.push(version.path_segment());
    dir
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::AggregatedResult;
    use crate::frame::{keys, Row};
    use crate::storage::MemoryObjectStore;
    use std::sync::Arc;

    fn run() -> RunName {
        RunName::new("city/base").unwrap()
    }

    fn frame(ids: &[&str]) -> DataFrame {
        let mut df = DataFrame::new(vec!["feature.weather.file".to_string()], vec!["Energy.Cooling.Annual".to_string()]);
        for (i, id) in ids.iter().enumerate() {
            df.push(Row::new(*id, vec!["lisbon".to_string()], vec![i as f64 * 2.5])).unwrap();
        }
        df
    }

    async fn published(ids_per_version: &[&[&str]]) -> (Arc<MemoryObjectStore>, ResultFetcher) {
        let store = Arc::new(MemoryObjectStore::new());
        let versioner = ExperimentVersioner::new(store.clone(), "experiments");
        for ids in ids_per_version {
            let result = AggregatedResult {
                run: Some(run()),
                frames: BTreeMap::from([
                    (keys::ENERGY_AND_PEAK.to_string(), frame(ids)),
                    (keys::HOURLY_DATA.to_string(), frame(&ids[..1])),
                ]),
                completed_branches: 1,
                ..Default::default()
            };
            versioner.publish(&run(), &result).await.unwrap();
        }
        let fetcher = ResultFetcher::new(store.clone(), "experiments");
        (store, fetcher)
    }

    #[tokio::test]
    async fn test_fetch_latest_writes_bin_and_csv() {
        let (_store, fetcher) = published(&[&["a"], &["a", "b", "c"]]).await;
        let out = tempfile::tempdir().unwrap();

        let paths = fetcher.fetch(&run(), None, out.path()).await.unwrap();
        let dir = out.path().join("city").join("base").join("v1.1.0");
        assert_eq!(paths.len(), 4);
        assert!(paths.iter().all(|p| p.starts_with(&dir)));

        let bytes = std::fs::read(dir.join("EnergyAndPeak.bin")).unwrap();
        assert_eq!(DataFrame::from_binary(&bytes).unwrap(), frame(&["a", "b", "c"]));
        let csv = std::fs::read_to_string(dir.join("EnergyAndPeak.csv")).unwrap();
        assert_eq!(csv.lines().count(), 4);
    }

    #[tokio::test]
    async fn test_fetch_pinned_version_and_key() {
        let (_store, fetcher) = published(&[&["a"], &["a", "b"]]).await;
        let out = tempfile::tempdir().unwrap();

        let request = FetchRequest::latest(run())
            .with_version(SemVer::INITIAL)
            .with_dataframe_key(keys::ENERGY_AND_PEAK);
        let paths = fetcher.fetch_request(&request, out.path()).await.unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("city/base/v1.0.0/EnergyAndPeak.bin"));

        // fetching again overwrites
        let again = fetcher.fetch_request(&request, out.path()).await.unwrap();
        assert_eq!(paths, again);

        let frame = fetcher
            .load_frame(&run(), Some(SemVer::INITIAL), keys::ENERGY_AND_PEAK)
            .await
            .unwrap();
        assert_eq!(frame.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_key_and_unpublished_run() {
        let (store, fetcher) = published(&[&["a"]]).await;
        let out = tempfile::tempdir().unwrap();
        let objects_before = store.len();

        let request = FetchRequest::latest(run()).with_dataframe_key("Nope");
        assert!(matches!(
            fetcher.fetch_request(&request, out.path()).await,
            Err(FanoutError::NotFound(_))
        ));

        let never = RunName::new("city/never").unwrap();
        assert!(matches!(
            fetcher.fetch(&never, None, out.path()).await,
            Err(FanoutError::NotFound(_))
        ));
        assert!(matches!(
            fetcher.fetch(&run(), Some(SemVer::new(9, 0, 0)), out.path()).await,
            Err(FanoutError::NotFound(_))
        ));
        assert_eq!(store.len(), objects_before);
    }

    #[tokio::test]
    async fn test_list_experiments() {
        let (_store, fetcher) = published(&[&["a"], &["b"]]).await;
        let listed = fetcher.list_experiments(None).await.unwrap();
        assert_eq!(listed[&run()], vec![SemVer::new(1, 0, 0), SemVer::new(1, 1, 0)]);
    }
}
