//! End-to-end runs on the local backend

use async_trait::async_trait;
use bem_fanout::frame::{keys, DataFrame};
use bem_fanout::planner::estimate_spec_size;
use bem_fanout::prelude::*;
use bem_fanout::worker::{EngineError, SimulationOutput};
use bem_fanout::{FanoutError, HourlyDataConfig, ObjectStore, PollConfig, SimulationEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

/// Dies on every spec whose numeric id falls in `doomed`
struct CrashingEngine {
    doomed: std::ops::Range<usize>,
}

#[async_trait]
impl SimulationEngine for CrashingEngine {
    async fn simulate(
        &self,
        spec: &BuildingSpec,
        hourly: &HourlyDataConfig,
    ) -> std::result::Result<SimulationOutput, EngineError> {
        let n: usize = spec
            .building_id
            .as_str()
            .trim_start_matches("bldg-")
            .parse()
            .unwrap_or(usize::MAX);
        if self.doomed.contains(&n) {
            panic!("engine process died on {}", spec.building_id);
        }
        SyntheticEngine.simulate(spec, hourly).await
    }

    fn name(&self) -> &str {
        "crashing"
    }
}

/// Never finishes within a test
struct StalledEngine;

#[async_trait]
impl SimulationEngine for StalledEngine {
    async fn simulate(
        &self,
        spec: &BuildingSpec,
        hourly: &HourlyDataConfig,
    ) -> std::result::Result<SimulationOutput, EngineError> {
        tokio::time::sleep(Duration::from_secs(600)).await;
        SyntheticEngine.simulate(spec, hourly).await
    }

    fn name(&self) -> &str {
        "stalled"
    }
}

fn manifest(count: usize) -> ExperimentSpec {
    manifest_of(0..count)
}

fn manifest_of(ids: std::ops::Range<usize>) -> ExperimentSpec {
    ExperimentSpec {
        name: "lisbon".to_string(),
        scenario: "baseline".to_string(),
        hourly_data_config: None,
        buildings: ids
            .map(|i| BuildingSpec::new(format!("bldg-{:03}", i), 14.0, 9.0, 3, "weather/PRT_Lisboa.zip"))
            .collect(),
    }
}

async fn published_ids(fanout: &Fanout, experiment: &bem_fanout::VersionedExperiment) -> Vec<String> {
    let bytes = fanout
        .object_store()
        .read_object(&experiment.dataframes[keys::ENERGY_AND_PEAK].path)
        .await
        .unwrap();
    DataFrame::from_binary(&bytes)
        .unwrap()
        .rows
        .iter()
        .map(|r| r.key.as_str().to_string())
        .collect()
}

/// Fanout whose budget fits exactly `per_branch` specs of `manifest`
fn fanout(engine: Arc<dyn SimulationEngine>, per_branch: usize) -> Fanout {
    let spec_size = estimate_spec_size(&manifest(1).buildings[0]);
    FanoutBuilder::new()
        .with_engine(engine)
        .with_max_branch_payload_bytes((spec_size * per_branch) as i64)
        .with_local_parallelism(4)
        .with_run_timeout(Duration::from_secs(30))
        .with_poll(PollConfig {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(50),
            multiplier: 1.5,
        })
        .build()
        .expect("fanout builds")
}

#[tokio::test]
async fn test_one_failed_branch_leaves_others_intact() {
    let fanout = fanout(Arc::new(CrashingEngine { doomed: 50..75 }), 25);
    let submitted = fanout
        .submit_manifest(&manifest(100), &CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(submitted.tasks.len(), 4);
    assert_eq!(submitted.accepted(), 4);
    assert_eq!(submitted.next_version, SemVer::new(1, 0, 0));

    let result = fanout
        .collect(&submitted.run, &CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(result.summary_rows(), 75);
    assert_eq!(result.incomplete_indices(), vec![2]);
    assert_eq!(result.incomplete_branches[0].spec_count, 25);
    assert!(result.incomplete_branches[0].reason.contains("worker crashed"));

    let experiment = fanout
        .versioner()
        .publish(&submitted.run, &result)
        .await
        .unwrap();
    assert_eq!(experiment.version, SemVer::new(1, 0, 0));
    assert_eq!(experiment.dataframes[keys::ENERGY_AND_PEAK].rows, 75);
    assert_eq!(experiment.incomplete_branches.len(), 1);
}

#[tokio::test]
async fn test_two_publishes_then_fetch_latest() {
    let fanout = fanout(Arc::new(SyntheticEngine), 10);
    let run = RunName::new("lisbon/baseline").unwrap();

    let first = fanout.run_manifest(&manifest(30), &CancelSignal::never()).await.unwrap();
    let second = fanout
        .collect_and_publish(&run, VersionBump::Minor, &CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(first.version, SemVer::new(1, 0, 0));
    assert_eq!(second.version, SemVer::new(1, 1, 0));

    let out = tempfile::tempdir().unwrap();
    let paths = fanout.fetch(&run, None, out.path()).await.unwrap();
    let dir = out.path().join("lisbon").join("baseline").join("v1.1.0");
    assert_eq!(paths, vec![dir.join("EnergyAndPeak.bin"), dir.join("EnergyAndPeak.csv")]);

    let fetched = DataFrame::from_binary(&std::fs::read(&paths[0]).unwrap()).unwrap();
    let published = fanout.object_store().read_object(&second.dataframes[keys::ENERGY_AND_PEAK].path).await.unwrap();
    assert_eq!(fetched, DataFrame::from_binary(&published).unwrap());
    assert_eq!(fetched.len(), 30);

    let csv = std::fs::read_to_string(&paths[1]).unwrap();
    assert_eq!(csv.lines().count(), 31);

    let listed = fanout.list_experiments(None).await.unwrap();
    assert_eq!(listed[&run], vec![SemVer::new(1, 0, 0), SemVer::new(1, 1, 0)]);
}

#[tokio::test]
async fn test_fetch_unpublished_run() {
    let fanout = fanout(Arc::new(SyntheticEngine), 10);
    let out = tempfile::tempdir().unwrap();
    let run = RunName::new("lisbon/never").unwrap();

    let err = assert_err!(fanout.fetch(&run, None, out.path()).await);
    assert!(matches!(err, FanoutError::NotFound(_)));
    assert!(!out.path().join("lisbon").exists());
}

#[tokio::test]
async fn test_resumed_submission_reuses_tasks() {
    let fanout = fanout(Arc::new(SyntheticEngine), 5);
    let first = assert_ok!(fanout.submit_manifest(&manifest(20), &CancelSignal::never()).await);
    let resumed = assert_ok!(fanout.resume(&manifest(20), &CancelSignal::never()).await);

    assert_eq!(first.tasks.len(), 4);
    for (a, b) in first.tasks.iter().zip(&resumed.tasks) {
        assert_eq!(a.handle, b.handle);
    }
}

#[tokio::test]
async fn test_cancelled_collect_without_results_times_out() {
    let fanout = fanout(Arc::new(StalledEngine), 5);
    let submitted = fanout
        .submit_manifest(&manifest(10), &CancelSignal::never())
        .await
        .unwrap();

    let (handle, signal) = bem_fanout::CancelHandle::new();
    handle.cancel();
    let err = assert_err!(fanout.collect(&submitted.run, &signal).await);
    assert!(matches!(err, FanoutError::AggregationTimeout { .. }));
}

#[tokio::test]
async fn test_branches_with_different_features_merge() {
    let fanout = fanout(Arc::new(SyntheticEngine), 1);
    let mut m = manifest(3);
    m.buildings[0] = m.buildings[0].clone().with_semantic("Age", 1975_i64);

    let experiment = assert_ok!(fanout.run_manifest(&m, &CancelSignal::never()).await);
    assert_eq!(experiment.version, SemVer::new(1, 0, 0));
    assert!(experiment.failures.is_empty());
    assert!(experiment.incomplete_branches.is_empty());
    assert_eq!(experiment.dataframes[keys::ENERGY_AND_PEAK].rows, 3);

    let bytes = fanout
        .object_store()
        .read_object(&experiment.dataframes[keys::ENERGY_AND_PEAK].path)
        .await
        .unwrap();
    let frame = DataFrame::from_binary(&bytes).unwrap();
    let age = frame
        .index_columns
        .iter()
        .position(|c| c == "feature.semantic.Age")
        .unwrap();
    let ages: Vec<_> = frame.rows.iter().map(|r| r.index[age].as_str()).collect();
    assert_eq!(ages, vec!["1975", "", ""]);
}

#[tokio::test]
async fn test_run_with_no_completed_branch_publishes_nothing() {
    let fanout = fanout(Arc::new(CrashingEngine { doomed: 50..75 }), 5);
    let run = RunName::new("lisbon/baseline").unwrap();

    let good = assert_ok!(fanout.run_manifest(&manifest_of(0..10), &CancelSignal::never()).await);
    assert_eq!(good.version, SemVer::new(1, 0, 0));

    assert_ok!(fanout.clear_run(&run).await);
    let err = assert_err!(fanout.run_manifest(&manifest_of(50..60), &CancelSignal::never()).await);
    assert!(matches!(err, FanoutError::AggregationFailed { branches: 2, .. }));

    let latest = assert_ok!(fanout.versioner().load_latest(&run).await);
    assert_eq!(latest.version, SemVer::new(1, 0, 0));
    assert_eq!(latest.dataframes[keys::ENERGY_AND_PEAK].rows, 10);
    assert_eq!(fanout.versioner().list_versions(&run).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_cleared_run_publishes_fresh_results() {
    let fanout = fanout(Arc::new(SyntheticEngine), 2);
    let run = RunName::new("lisbon/baseline").unwrap();

    let old = assert_ok!(fanout.run_manifest(&manifest_of(0..4), &CancelSignal::never()).await);
    assert_eq!(published_ids(&fanout, &old).await, vec!["bldg-000", "bldg-001", "bldg-002", "bldg-003"]);

    assert_eq!(assert_ok!(fanout.clear_run(&run).await), 2);
    let fresh = assert_ok!(fanout.run_manifest(&manifest_of(10..14), &CancelSignal::never()).await);
    assert_eq!(fresh.version, SemVer::new(1, 1, 0));
    assert_eq!(published_ids(&fanout, &fresh).await, vec!["bldg-010", "bldg-011", "bldg-012", "bldg-013"]);

    // the earlier version is untouched
    assert_eq!(published_ids(&fanout, &old).await, vec!["bldg-000", "bldg-001", "bldg-002", "bldg-003"]);
}
