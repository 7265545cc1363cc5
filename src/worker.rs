//! Branch execution
//!
//! ## Table of Contents
//! - **SimulationEngine**: Black-box per-building simulator
//! - **SimulationOutput**: Monthly energy/peak by end use plus hourly series
//! - **SpecOutcome**: Tagged per-spec result (success rows or failure record)
//! - **SpecFailure / ErrorKind**: Structured per-spec failure
//! - **PartialResult**: Output of one branch
//! - **WorkerRunner**: Runs the engine over every spec of a branch
//!
//! A branch always yields a `PartialResult`; individual spec failures are
//! recorded in it and never abort the branch.

use crate::error::Result;
use crate::frame::{keys, DataFrame, Row};
use crate::job::TaskDescriptor;
use crate::metrics::SharedMetrics;
use crate::planner::Branch;
use crate::spec::{BuildingSpec, HourlyDataConfig};
use crate::storage::object::{join_path, ObjectStore};
use crate::types::{RunName, SpecId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Category of a per-spec failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Footprint or storey data rejected
    InvalidGeometry,
    /// Engine crashed or exceeded its time limit
    EngineCrash,
    /// Weather reference missing or unusable
    InvalidWeather,
    /// Anything else
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidGeometry => "InvalidGeometry",
            Self::EngineCrash => "EngineCrash",
            Self::InvalidWeather => "InvalidWeather",
            Self::Other => "Other",
        };
        f.write_str(s)
    }
}

/// Error returned by a [`SimulationEngine`]
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    /// Failure category
    pub kind: ErrorKind,
    /// Engine message
    pub message: String,
}

impl EngineError {
    /// Create an engine error
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Raw output of one simulation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationOutput {
    /// Monthly energy by end use (kWh/m²)
    pub monthly_energy: BTreeMap<String, [f64; 12]>,
    /// Monthly peak demand by end use (kW/m²)
    pub monthly_peak: BTreeMap<String, [f64; 12]>,
    /// Hourly series by variable name
    pub hourly: BTreeMap<String, Vec<f64>>,
}

/// Per-building simulator
#[async_trait]
pub trait SimulationEngine: Send + Sync {
    /// Simulate one building
    async fn simulate(
        &self,
        spec: &BuildingSpec,
        hourly: &HourlyDataConfig,
    ) -> std::result::Result<SimulationOutput, EngineError>;

    /// Engine name for logging
    fn name(&self) -> &str;
}

/// Shared engine
pub type BoxedEngine = Arc<dyn SimulationEngine>;

/// Failure record for one spec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecFailure {
    /// Failing spec
    pub spec_id: SpecId,
    /// Category
    pub error_kind: ErrorKind,
    /// Human-readable message
    pub message: String,
}

impl SpecFailure {
    /// Create a failure record
    pub fn new(spec_id: SpecId, error_kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            spec_id,
            error_kind,
            message: message.into(),
        }
    }
}

impl From<SpecFailure> for crate::error::FanoutError {
    fn from(f: SpecFailure) -> Self {
        Self::SpecExecutionFailure {
            spec_id: f.spec_id.to_string(),
            message: format!("{}: {}", f.error_kind, f.message),
        }
    }
}

/// Result of running one spec
#[derive(Debug, Clone, PartialEq)]
pub enum SpecOutcome {
    /// Simulation produced rows
    Success {
        /// Summary row for `EnergyAndPeak`
        summary: FrameRows,
        /// Hourly rows, absent unless requested
        hourly: Option<FrameRows>,
    },
    /// Simulation failed
    Failure(SpecFailure),
}

/// Rows for one frame together with their column names
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRows {
    /// Index column names
    pub index_columns: Vec<String>,
    /// Value column names
    pub value_columns: Vec<String>,
    /// Rows (one for summaries, one per hour for timeseries)
    pub rows: Vec<Row>,
}

impl FrameRows {
    fn into_frame(self) -> Result<DataFrame> {
        let mut frame = DataFrame::new(self.index_columns, self.value_columns);
        for row in self.rows {
            frame.push(row)?;
        }
        Ok(frame)
    }
}

/// Output of one branch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    /// Parent run
    pub run: Option<RunName>,
    /// Branch index
    pub branch_index: usize,
    /// Submission the branch ran for
    #[serde(default)]
    pub submission: String,
    /// Frames by dataframe key
    pub frames: BTreeMap<String, DataFrame>,
    /// Per-spec failures
    pub failures: Vec<SpecFailure>,
    /// Host that executed the branch
    pub worker: String,
}

impl PartialResult {
    /// Object path of a branch's uploaded result
    pub fn storage_path(prefix: &str, run: &RunName, submission: &str, branch_index: usize) -> String {
        let file = format!("branch-{:06}.json", branch_index);
        join_path([prefix, run.as_str(), "_partials", submission, file.as_str()])
    }

    /// Summary rows produced
    pub fn summary_rows(&self) -> usize {
        self.frames
            .get(keys::ENERGY_AND_PEAK)
            .map(DataFrame::len)
            .unwrap_or(0)
    }

    /// Upload to the object store
    ///
    /// A result already present for the branch and submission is kept:
    /// redelivered tasks produce the same rows.
    pub async fn upload(&self, store: &dyn ObjectStore, prefix: &str) -> Result<String> {
        let run = self
            .run
            .as_ref()
            .ok_or_else(|| crate::error::FanoutError::config("partial result has no run"))?;
        let path = Self::storage_path(prefix, run, &self.submission, self.branch_index);
        let bytes = serde_json::to_vec(self)?;
        match store.write_object(&path, bytes.into()).await {
            Ok(()) => Ok(path),
            Err(crate::error::FanoutError::VersionCollision { .. }) => {
                debug!(path = %path, "Partial result already uploaded");
                Ok(path)
            }
            Err(e) => Err(e),
        }
    }

    /// Download a branch's result, `NotFound` if the worker never uploaded it
    pub async fn download(
        store: &dyn ObjectStore,
        prefix: &str,
        run: &RunName,
        submission: &str,
        branch_index: usize,
    ) -> Result<Self> {
        let bytes = store
            .read_object(&Self::storage_path(prefix, run, submission, branch_index))
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Runs the simulation engine over a branch
#[derive(Clone)]
pub struct WorkerRunner {
    engine: BoxedEngine,
    spec_timeout: Option<Duration>,
    metrics: Option<SharedMetrics>,
    worker: String,
}

impl WorkerRunner {
    /// Create a runner for an engine
    pub fn new(engine: BoxedEngine) -> Self {
        Self {
            engine,
            spec_timeout: None,
            metrics: None,
            worker: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "worker".to_string()),
        }
    }

    /// Bound each simulation; expiry is recorded as `EngineCrash`
    pub fn with_spec_timeout(mut self, timeout: Duration) -> Self {
        self.spec_timeout = Some(timeout);
        self
    }

    /// Attach metrics
    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Override the reported worker name
    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker = name.into();
        self
    }

    /// Execute a task descriptor
    pub async fn run_descriptor(&self, descriptor: &TaskDescriptor) -> PartialResult {
        let mut result = self.run_branch(&descriptor.branch, &descriptor.hourly).await;
        result.submission = descriptor.submission.clone();
        result
    }

    /// Run every spec of a branch in planned order
    pub async fn run_branch(&self, branch: &Branch, hourly: &HourlyDataConfig) -> PartialResult {
        info!(
            run = %branch.run,
            branch = branch.index,
            specs = branch.len(),
            engine = self.engine.name(),
            "Running branch"
        );

        let mut result = PartialResult {
            run: Some(branch.run.clone()),
            branch_index: branch.index,
            worker: self.worker.clone(),
            ..Default::default()
        };

        for spec in &branch.specs {
            match self.run_spec(spec, hourly).await {
                SpecOutcome::Success { summary, hourly } => {
                    if let Err(failure) = merge_rows(&mut result.frames, spec, summary, hourly) {
                        self.record_failure(&mut result, failure);
                    }
                }
                SpecOutcome::Failure(failure) => self.record_failure(&mut result, failure),
            }
        }

        info!(
            run = %branch.run,
            branch = branch.index,
            rows = result.summary_rows(),
            failures = result.failures.len(),
            "Branch finished"
        );
        result
    }

    fn record_failure(&self, result: &mut PartialResult, failure: SpecFailure) {
        warn!(
            spec = %failure.spec_id,
            kind = %failure.error_kind,
            message = %failure.message,
            "Spec failed"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_spec_failure(&failure.error_kind.to_string());
        }
        result.failures.push(failure);
    }

    /// Run one spec
    pub async fn run_spec(&self, spec: &BuildingSpec, hourly: &HourlyDataConfig) -> SpecOutcome {
        let id = spec.building_id.clone();
        if let Err(reason) = spec.validate() {
            return SpecOutcome::Failure(SpecFailure::new(id, ErrorKind::InvalidGeometry, reason));
        }
        if !spec.weather_is_valid() {
            return SpecOutcome::Failure(SpecFailure::new(
                id,
                ErrorKind::InvalidWeather,
                format!("unusable weather reference '{}'", spec.weather),
            ));
        }

        let simulated = match self.spec_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.engine.simulate(spec, hourly)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(EngineError::new(
                    ErrorKind::EngineCrash,
                    format!("simulation exceeded {}s", limit.as_secs_f64()),
                )),
            },
            None => self.engine.simulate(spec, hourly).await,
        };

        match simulated {
            Ok(output) => match build_rows(spec, &output, hourly) {
                Ok((summary, hourly)) => SpecOutcome::Success { summary, hourly },
                Err(message) => SpecOutcome::Failure(SpecFailure::new(id, ErrorKind::Other, message)),
            },
            Err(e) => SpecOutcome::Failure(SpecFailure::new(id, e.kind, e.message)),
        }
    }
}

fn build_rows(
    spec: &BuildingSpec,
    output: &SimulationOutput,
    hourly: &HourlyDataConfig,
) -> std::result::Result<(FrameRows, Option<FrameRows>), String> {
    if output.monthly_energy.is_empty() {
        return Err("engine returned no energy results".to_string());
    }

    let features = spec.features();
    let index_columns: Vec<String> = features.keys().cloned().collect();
    let index: Vec<String> = features.values().map(ToString::to_string).collect();

    let mut value_columns = Vec::new();
    let mut values = Vec::new();
    for (measure, series) in [("Energy", &output.monthly_energy), ("Peak", &output.monthly_peak)] {
        for (end_use, monthly) in series {
            for (month, value) in MONTHS.iter().zip(monthly) {
                value_columns.push(format!("{}.{}.{}", measure, end_use, month));
                values.push(*value);
            }
            let annual = if measure == "Energy" {
                monthly.iter().sum()
            } else {
                monthly.iter().cloned().fold(f64::MIN, f64::max)
            };
            value_columns.push(format!("{}.{}.Annual", measure, end_use));
            values.push(annual);
        }
    }

    let summary = FrameRows {
        index_columns: index_columns.clone(),
        value_columns,
        rows: vec![Row::new(spec.building_id.clone(), index.clone(), values)],
    };

    if !hourly.is_requested() || !hourly.output_mode.emits_dataframes() {
        return Ok((summary, None));
    }

    let mut series = Vec::with_capacity(hourly.data.len());
    for variable in &hourly.data {
        let values = output
            .hourly
            .get(variable)
            .ok_or_else(|| format!("engine did not report hourly variable '{}'", variable))?;
        series.push(values);
    }
    let hours = series.iter().map(|s| s.len()).min().unwrap_or(0);

    let mut hourly_index_columns = index_columns;
    hourly_index_columns.push("hour".to_string());
    let rows = (0..hours)
        .map(|h| {
            let mut idx = index.clone();
            idx.push(h.to_string());
            Row::new(
                spec.building_id.clone(),
                idx,
                series.iter().map(|s| s[h]).collect(),
            )
        })
        .collect();

    Ok((
        summary,
        Some(FrameRows {
            index_columns: hourly_index_columns,
            value_columns: hourly.data.clone(),
            rows,
        }),
    ))
}

fn merge_rows(
    frames: &mut BTreeMap<String, DataFrame>,
    spec: &BuildingSpec,
    summary: FrameRows,
    hourly: Option<FrameRows>,
) -> std::result::Result<(), SpecFailure> {
    let malformed = |key: &str, e: crate::error::FanoutError| {
        SpecFailure::new(
            spec.building_id.clone(),
            ErrorKind::Other,
            format!("malformed {} rows: {}", key, e),
        )
    };

    // build both before touching either frame
    let summary = summary
        .into_frame()
        .map_err(|e| malformed(keys::ENERGY_AND_PEAK, e))?;
    let hourly = match hourly {
        Some(rows) => Some(rows.into_frame().map_err(|e| malformed(keys::HOURLY_DATA, e))?),
        None => None,
    };

    frames
        .entry(keys::ENERGY_AND_PEAK.to_string())
        .or_default()
        .concat(summary);
    if let Some(h) = hourly {
        frames.entry(keys::HOURLY_DATA.to_string()).or_default().concat(h);
    }
    Ok(())
}

/// Engine returning deterministic synthetic results
///
/// Useful for dry runs and tests: values depend only on the spec geometry.
#[derive(Debug, Clone, Default)]
pub struct SyntheticEngine;

#[async_trait]
impl SimulationEngine for SyntheticEngine {
    async fn simulate(
        &self,
        spec: &BuildingSpec,
        hourly: &HourlyDataConfig,
    ) -> std::result::Result<SimulationOutput, EngineError> {
        let area = spec.conditioned_area().max(1.0);
        let base = 100.0 / area.sqrt();
        let mut output = SimulationOutput::default();
        for (i, end_use) in ["Heating", "Cooling", "Lighting", "Equipment"].iter().enumerate() {
            let scale = base * (i as f64 + 1.0);
            let mut energy = [0.0; 12];
            let mut peak = [0.0; 12];
            for m in 0..12 {
                let season = ((m as f64) / 12.0 * std::f64::consts::TAU).cos();
                energy[m] = scale * (1.5 + season);
                peak[m] = energy[m] / 100.0;
            }
            output.monthly_energy.insert(end_use.to_string(), energy);
            output.monthly_peak.insert(end_use.to_string(), peak);
        }
        for variable in &hourly.data {
            let series = (0..8760).map(|h| base * ((h % 24) as f64 / 24.0)).collect();
            output.hourly.insert(variable.clone(), series);
        }
        Ok(output)
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::HourlyOutputMode;
    use crate::storage::MemoryObjectStore;

    struct FlakyEngine;

    #[async_trait]
    impl SimulationEngine for FlakyEngine {
        async fn simulate(
            &self,
            spec: &BuildingSpec,
            hourly: &HourlyDataConfig,
        ) -> std::result::Result<SimulationOutput, EngineError> {
            match spec.building_id.as_str() {
                "crash" => Err(EngineError::new(ErrorKind::EngineCrash, "segfault")),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    SyntheticEngine.simulate(spec, hourly).await
                }
                _ => SyntheticEngine.simulate(spec, hourly).await,
            }
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn branch(ids: &[&str]) -> Branch {
        Branch {
            run: RunName::new("city/base").unwrap(),
            index: 1,
            specs: ids
                .iter()
                .map(|id| BuildingSpec::new(*id, 20.0, 12.0, 3, "weather/PRT_Lisboa.zip"))
                .collect(),
            payload_bytes: 0,
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_branch() {
        let mut b = branch(&["a", "crash", "c"]);
        b.specs.push(BuildingSpec::new("tiny", 1.0, 1.0, 1, "w.zip"));
        b.specs.push(BuildingSpec::new("noweather", 10.0, 10.0, 1, ""));

        let runner = WorkerRunner::new(Arc::new(FlakyEngine));
        let result = runner.run_branch(&b, &HourlyDataConfig::default()).await;

        assert_eq!(result.branch_index, 1);
        assert_eq!(result.summary_rows(), 2);
        assert!(!result.frames.contains_key(keys::HOURLY_DATA));

        let kinds: Vec<_> = result.failures.iter().map(|f| (f.spec_id.as_str(), f.error_kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("crash", ErrorKind::EngineCrash),
                ("tiny", ErrorKind::InvalidGeometry),
                ("noweather", ErrorKind::InvalidWeather),
            ]
        );

        let summary = &result.frames[keys::ENERGY_AND_PEAK];
        assert_eq!(summary.rows[0].key.as_str(), "a");
        assert_eq!(summary.rows[1].key.as_str(), "c");
        assert!(summary.value_columns.contains(&"Energy.Heating.Annual".to_string()));
    }

    #[tokio::test]
    async fn test_specs_with_different_features_share_branch() {
        let mut b = branch(&["a", "b", "c"]);
        b.specs[1] = b.specs[1].clone().with_semantic("Age", 1975_i64);

        let runner = WorkerRunner::new(Arc::new(SyntheticEngine));
        let result = runner.run_branch(&b, &HourlyDataConfig::default()).await;

        assert!(result.failures.is_empty());
        let summary = &result.frames[keys::ENERGY_AND_PEAK];
        assert_eq!(summary.len(), 3);
        let age = summary
            .index_columns
            .iter()
            .position(|c| c.ends_with("Age"))
            .unwrap();
        let ages: Vec<_> = summary.rows.iter().map(|r| r.index[age].as_str()).collect();
        assert_eq!(ages, vec!["", "1975", ""]);
    }

    #[tokio::test]
    async fn test_spec_timeout_is_engine_crash() {
        let runner = WorkerRunner::new(Arc::new(FlakyEngine)).with_spec_timeout(Duration::from_millis(20));
        let outcome = runner
            .run_spec(&branch(&["slow"]).specs[0], &HourlyDataConfig::default())
            .await;
        match outcome {
            SpecOutcome::Failure(f) => assert_eq!(f.error_kind, ErrorKind::EngineCrash),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hourly_output_modes() {
        let runner = WorkerRunner::new(Arc::new(SyntheticEngine));
        let mut hourly = HourlyDataConfig {
            data: vec!["Zone Mean Air Temperature".to_string()],
            output_mode: HourlyOutputMode::DataframesOnly,
        };

        let result = runner.run_branch(&branch(&["a", "b"]), &hourly).await;
        let frame = &result.frames[keys::HOURLY_DATA];
        assert_eq!(frame.len(), 2 * 8760);
        assert_eq!(frame.index_columns.last().map(String::as_str), Some("hour"));

        hourly.output_mode = HourlyOutputMode::FilerefOnly;
        let result = runner.run_branch(&branch(&["a"]), &hourly).await;
        assert!(!result.frames.contains_key(keys::HOURLY_DATA));
        assert_eq!(result.summary_rows(), 1);
    }

    #[tokio::test]
    async fn test_partial_upload_is_idempotent() {
        let store = MemoryObjectStore::new();
        let runner = WorkerRunner::new(Arc::new(SyntheticEngine)).with_worker_name("node-1");
        let descriptor = TaskDescriptor::new(branch(&["a"]), HourlyDataConfig::default(), "s1");
        let result = runner.run_descriptor(&descriptor).await;

        let path = result.upload(&store, "runs").await.unwrap();
        assert_eq!(path, "runs/city/base/_partials/s1/branch-000001.json");
        assert_eq!(result.upload(&store, "runs").await.unwrap(), path);

        let run = RunName::new("city/base").unwrap();
        let loaded = PartialResult::download(&store, "runs", &run, "s1", 1).await.unwrap();
        assert_eq!(loaded.summary_rows(), 1);
        assert_eq!(loaded.frames[keys::ENERGY_AND_PEAK].rows[0].key.as_str(), "a");
        assert_eq!(loaded.worker, "node-1");
        assert_eq!(loaded.submission, "s1");

        let next = TaskDescriptor::new(branch(&["b"]), HourlyDataConfig::default(), "s2");
        let rerun = runner.run_descriptor(&next).await;
        assert_ne!(rerun.upload(&store, "runs").await.unwrap(), path);
        let reloaded = PartialResult::download(&store, "runs", &run, "s2", 1).await.unwrap();
        assert_eq!(reloaded.frames[keys::ENERGY_AND_PEAK].rows[0].key.as_str(), "b");
    }
}
