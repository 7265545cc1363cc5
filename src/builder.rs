//! FanoutBuilder for configuring and constructing Fanout instances
//!
//! ## Table of Contents
//! - **FanoutBuilder**: Builder pattern for Fanout configuration
//! - **FanoutConfig**: Complete configuration struct, with environment overlay

use crate::aggregator::PollConfig;
use crate::backend::{BoxedBackend, LocalBackend, NomadBackend, NomadConfig};
use crate::error::{FanoutError, Result};
use crate::metrics::FanoutMetrics;
use crate::resilience::RetryConfig;
use crate::runtime::Fanout;
use crate::spec::HourlyOutputMode;
use crate::storage::{
    BoxedObjectStore, BoxedStateStore, FileStore, LocalObjectStore, MemoryObjectStore, MemoryStore,
    S3Config,
};
use crate::submitter::DEFAULT_SUBMIT_CONCURRENCY;
use crate::worker::{BoxedEngine, WorkerRunner};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Complete Fanout configuration
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Object store prefix for experiments and partial results
    pub bucket_prefix: String,
    /// Serialized size budget of one branch
    pub max_branch_payload_bytes: i64,
    /// Plan only the first N specs of a manifest
    pub max_specs: Option<usize>,
    /// Submission retry policy
    pub retry: RetryConfig,
    /// In-flight submissions
    pub submit_concurrency: usize,
    /// Aggregator poll interval bounds
    pub poll: PollConfig,
    /// Run-level aggregation timeout
    pub run_timeout: Duration,
    /// Per-spec engine timeout
    pub spec_timeout: Option<Duration>,
    /// Per-branch timeout of the local backend
    pub task_timeout: Option<Duration>,
    /// Concurrent branches of the local backend
    pub local_parallelism: usize,
    /// Override of the manifests' hourly output mode
    pub hourly_output_mode: Option<HourlyOutputMode>,
    /// Nomad settings; the local backend is used when absent
    pub nomad: Option<NomadConfig>,
    /// Task ledger file, in-memory when absent
    pub store_path: Option<PathBuf>,
    /// Filesystem object store root
    pub object_root: Option<PathBuf>,
    /// S3 object store settings
    pub s3: Option<S3Config>,
    /// Enable metrics
    pub metrics_enabled: bool,
    /// Node name
    pub node_name: String,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            bucket_prefix: "experiments".to_string(),
            max_branch_payload_bytes: 64 * 1024,
            max_specs: None,
            retry: RetryConfig::default(),
            submit_concurrency: DEFAULT_SUBMIT_CONCURRENCY,
            poll: PollConfig::default(),
            run_timeout: Duration::from_secs(6 * 60 * 60),
            spec_timeout: None,
            task_timeout: None,
            local_parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            hourly_output_mode: None,
            nomad: None,
            store_path: None,
            object_root: None,
            s3: None,
            metrics_enabled: true,
            node_name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "fanout-node".to_string()),
        }
    }
}

impl FanoutConfig {
    /// Defaults overlaid with `FANOUT_*`, `NOMAD_*` and S3 environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok())?;
        if config.s3.is_none() {
            config.s3 = S3Config::from_env();
        }
        Ok(config)
    }

    /// Defaults overlaid with variables resolved by `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let parse = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(prefix) = parse("FANOUT_BUCKET_PREFIX") {
            config.bucket_prefix = prefix;
        }
        if let Some(bytes) = parsed(&lookup, "FANOUT_MAX_BRANCH_BYTES")? {
            config.max_branch_payload_bytes = bytes;
        }
        config.max_specs = parsed(&lookup, "FANOUT_MAX_SPECS")?.or(config.max_specs);
        if let Some(n) = parsed(&lookup, "FANOUT_SUBMIT_CONCURRENCY")? {
            config.submit_concurrency = n;
        }
        if let Some(n) = parsed(&lookup, "FANOUT_SUBMIT_RETRIES")? {
            config.retry = config.retry.max_retries(n);
        }
        if let Some(secs) = parsed::<u64>(&lookup, "FANOUT_RUN_TIMEOUT_SECS")? {
            config.run_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed::<u64>(&lookup, "FANOUT_SPEC_TIMEOUT_SECS")? {
            config.spec_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(secs) = parsed::<u64>(&lookup, "FANOUT_POLL_MAX_SECS")? {
            config.poll.max_interval = Duration::from_secs(secs);
        }
        if let Some(n) = parsed(&lookup, "FANOUT_LOCAL_PARALLELISM")? {
            config.local_parallelism = n;
        }
        if let Some(mode) = parse("FANOUT_HOURLY_OUTPUT_MODE") {
            config.hourly_output_mode = Some(serde_yaml::from_str(&mode).map_err(|_| {
                FanoutError::config(format!("FANOUT_HOURLY_OUTPUT_MODE: unknown mode '{}'", mode))
            })?);
        }
        config.store_path = parse("FANOUT_STATE_PATH").map(PathBuf::from);
        config.object_root = parse("FANOUT_OBJECT_ROOT").map(PathBuf::from);
        if let Some(enabled) = parsed(&lookup, "FANOUT_METRICS")? {
            config.metrics_enabled = enabled;
        }
        if let Some(name) = parse("FANOUT_NODE_NAME") {
            config.node_name = name;
        }

        if let Some(address) = parse("NOMAD_ADDR") {
            let mut nomad = NomadConfig {
                address,
                token: parse("NOMAD_TOKEN"),
                ..NomadConfig::default()
            };
            if let Some(namespace) = parse("NOMAD_NAMESPACE") {
                nomad.namespace = namespace;
            }
            if let Some(region) = parse("NOMAD_REGION") {
                nomad.region = region;
            }
            if let Some(job) = parse("FANOUT_NOMAD_JOB") {
                nomad.job_id = job;
            }
            config.nomad = Some(nomad);
        }

        Ok(config)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| FanoutError::config(format!("{}: cannot parse '{}'", key, raw))),
        None => Ok(None),
    }
}

/// Builder for constructing Fanout instances
pub struct FanoutBuilder {
    config: FanoutConfig,
    engine: Option<BoxedEngine>,
    backend: Option<BoxedBackend>,
    state_store: Option<BoxedStateStore>,
    object_store: Option<BoxedObjectStore>,
}

impl FanoutBuilder {
    /// Create a new FanoutBuilder with default configuration
    pub fn new() -> Self {
        Self::with_config(FanoutConfig::default())
    }

    /// Start from an existing configuration
    pub fn with_config(config: FanoutConfig) -> Self {
        Self {
            config,
            engine: None,
            backend: None,
            state_store: None,
            object_store: None,
        }
    }

    /// Set the object store prefix
    pub fn with_bucket_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.bucket_prefix = prefix.into();
        self
    }

    /// Set the branch payload budget
    pub fn with_max_branch_payload_bytes(mut self, bytes: i64) -> Self {
        self.config.max_branch_payload_bytes = bytes;
        self
    }

    /// Plan only the first `max` specs
    pub fn with_max_specs(mut self, max: usize) -> Self {
        self.config.max_specs = Some(max);
        self
    }

    /// Set the submission retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Set submission concurrency
    pub fn with_submit_concurrency(mut self, concurrency: usize) -> Self {
        self.config.submit_concurrency = concurrency;
        self
    }

    /// Set poll interval bounds
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.config.poll = poll;
        self
    }

    /// Set the run-level aggregation timeout
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.config.run_timeout = timeout;
        self
    }

    /// Bound each simulation
    pub fn with_spec_timeout(mut self, timeout: Duration) -> Self {
        self.config.spec_timeout = Some(timeout);
        self
    }

    /// Bound each local branch
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.config.task_timeout = Some(timeout);
        self
    }

    /// Set local backend parallelism
    pub fn with_local_parallelism(mut self, parallelism: usize) -> Self {
        self.config.local_parallelism = parallelism;
        self
    }

    /// Force an hourly output mode for every manifest
    pub fn with_hourly_output_mode(mut self, mode: HourlyOutputMode) -> Self {
        self.config.hourly_output_mode = Some(mode);
        self
    }

    /// Dispatch branches to Nomad
    pub fn with_nomad(mut self, nomad: NomadConfig) -> Self {
        self.config.nomad = Some(nomad);
        self
    }

    /// Set the Nomad API endpoint, keeping other Nomad settings
    pub fn with_nomad_api(mut self, url: impl Into<String>) -> Self {
        let nomad = self.config.nomad.get_or_insert_with(NomadConfig::default);
        nomad.address = url.into();
        self
    }

    /// Set the Nomad ACL token
    pub fn with_nomad_token(mut self, token: impl Into<String>) -> Self {
        let nomad = self.config.nomad.get_or_insert_with(NomadConfig::default);
        nomad.token = Some(token.into());
        self
    }

    /// Persist the task ledger to a file
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.store_path = Some(path.into());
        self
    }

    /// Keep experiments on the local filesystem
    pub fn with_object_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.object_root = Some(root.into());
        self
    }

    /// Keep experiments in S3
    pub fn with_s3(mut self, s3: S3Config) -> Self {
        self.config.s3 = Some(s3);
        self
    }

    /// Set the simulation engine run by the local backend
    pub fn with_engine(mut self, engine: BoxedEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Set a custom backend
    pub fn with_backend(mut self, backend: BoxedBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set a custom state store
    pub fn with_state_store(mut self, store: BoxedStateStore) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Set a custom object store
    pub fn with_object_store(mut self, store: BoxedObjectStore) -> Self {
        self.object_store = Some(store);
        self
    }

    /// Set node name
    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.config.node_name = name.into();
        self
    }

    /// Enable or disable metrics
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.config.metrics_enabled = enabled;
        self
    }

    /// Build, connecting to S3 first when it is configured
    pub async fn connect(mut self) -> Result<Fanout> {
        if self.object_store.is_none() {
            if let Some(s3) = &self.config.s3 {
                self.object_store = Some(connect_s3(s3).await?);
            }
        }
        self.build()
    }

    /// Build the Fanout instance
    ///
    /// S3 settings need [`FanoutBuilder::connect`]; here they are an error
    /// unless an object store was set explicitly.
    pub fn build(self) -> Result<Fanout> {
        info!(
            node = %self.config.node_name,
            prefix = %self.config.bucket_prefix,
            "Building Fanout instance"
        );

        if self.config.max_branch_payload_bytes <= 0 {
            return Err(FanoutError::config(format!(
                "max branch payload must be positive, got {}",
                self.config.max_branch_payload_bytes
            )));
        }

        let metrics = if self.config.metrics_enabled {
            Some(Arc::new(FanoutMetrics::new()?))
        } else {
            None
        };

        let state_store: BoxedStateStore = match self.state_store {
            Some(s) => s,
            None => match &self.config.store_path {
                Some(path) => Arc::new(FileStore::open(path)?),
                None => Arc::new(MemoryStore::new()),
            },
        };

        let object_store: BoxedObjectStore = match self.object_store {
            Some(s) => s,
            None if self.config.s3.is_some() => {
                return Err(FanoutError::config(
                    "S3 object store configured; use connect() to build",
                ))
            }
            None => match &self.config.object_root {
                Some(root) => Arc::new(LocalObjectStore::open(root)?),
                None => Arc::new(MemoryObjectStore::new()),
            },
        };

        let backend: BoxedBackend = match (self.backend, &self.config.nomad) {
            (Some(backend), _) => backend,
            (None, Some(nomad)) => Arc::new(NomadBackend::new(
                nomad.clone(),
                object_store.clone(),
                self.config.bucket_prefix.clone(),
            )?),
            (None, None) => {
                let engine = self.engine.clone().ok_or_else(|| {
                    FanoutError::config("no backend configured: set a Nomad address or a simulation engine")
                })?;
                let runner = worker_runner(engine, &self.config, metrics.clone());
                let mut local = LocalBackend::new(runner, self.config.local_parallelism);
                if let Some(timeout) = self.config.task_timeout {
                    local = local.with_task_timeout(timeout);
                }
                Arc::new(local)
            }
        };

        info!(backend = backend.name(), objects = object_store.name(), "Fanout wired");
        Ok(Fanout::new(
            self.config,
            backend,
            state_store,
            object_store,
            self.engine,
            metrics,
        ))
    }
}

impl Default for FanoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker runner configured from `config`
pub(crate) fn worker_runner(
    engine: BoxedEngine,
    config: &FanoutConfig,
    metrics: Option<crate::metrics::SharedMetrics>,
) -> WorkerRunner {
    let mut runner = WorkerRunner::new(engine).with_worker_name(config.node_name.clone());
    if let Some(timeout) = config.spec_timeout {
        runner = runner.with_spec_timeout(timeout);
    }
    if let Some(metrics) = metrics {
        runner = runner.with_metrics(metrics);
    }
    runner
}

#[cfg(feature = "s3")]
async fn connect_s3(config: &S3Config) -> Result<BoxedObjectStore> {
    Ok(Arc::new(crate::storage::S3ObjectStore::connect(config).await?))
}

#[cfg(not(feature = "s3"))]
async fn connect_s3(config: &S3Config) -> Result<BoxedObjectStore> {
    Err(FanoutError::config(format!(
        "bucket '{}' requires the `s3` feature",
        config.bucket
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::SyntheticEngine;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_builder_requires_backend() {
        let err = FanoutBuilder::new().build().err().unwrap();
        assert!(matches!(err, FanoutError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_builder_local_engine() {
        let fanout = FanoutBuilder::new()
            .with_engine(Arc::new(SyntheticEngine))
            .with_local_parallelism(2)
            .build()
            .unwrap();
        assert_eq!(fanout.backend().name(), "local");
        assert!(fanout.metrics().is_some());
    }

    #[test]
    fn test_builder_with_nomad() {
        let fanout = FanoutBuilder::new()
            .with_nomad_api("http://localhost:4646")
            .with_nomad_token("secret-token")
            .with_metrics(false)
            .build()
            .unwrap();
        assert_eq!(fanout.backend().name(), "nomad");
        assert!(fanout.metrics().is_none());
    }

    #[test]
    fn test_builder_with_file_stores() {
        let dir = tempfile::tempdir().unwrap();
        let fanout = FanoutBuilder::new()
            .with_engine(Arc::new(SyntheticEngine))
            .with_store_path(dir.path().join("ledger.json"))
            .with_object_root(dir.path().join("objects"))
            .build()
            .unwrap();
        assert_eq!(fanout.object_store().name(), "local");
    }

    #[test]
    fn test_builder_rejects_bad_budget() {
        let result = FanoutBuilder::new()
            .with_engine(Arc::new(SyntheticEngine))
            .with_max_branch_payload_bytes(0)
            .build();
        assert!(matches!(result, Err(FanoutError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_s3_needs_connect() {
        let result = FanoutBuilder::new()
            .with_engine(Arc::new(SyntheticEngine))
            .with_s3(S3Config::new("bem"))
            .build();
        assert!(matches!(result, Err(FanoutError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_config_from_lookup() {
        let config = FanoutConfig::from_lookup(lookup(&[
            ("FANOUT_BUCKET_PREFIX", "sims"),
            ("FANOUT_MAX_BRANCH_BYTES", "4096"),
            ("FANOUT_MAX_SPECS", "10"),
            ("FANOUT_RUN_TIMEOUT_SECS", "90"),
            ("FANOUT_HOURLY_OUTPUT_MODE", "fileref-only"),
            ("FANOUT_METRICS", "false"),
            ("NOMAD_ADDR", "http://nomad:4646"),
            ("NOMAD_NAMESPACE", "sims"),
            ("FANOUT_NOMAD_JOB", "ep-worker"),
        ]))
        .unwrap();

        assert_eq!(config.bucket_prefix, "sims");
        assert_eq!(config.max_branch_payload_bytes, 4096);
        assert_eq!(config.max_specs, Some(10));
        assert_eq!(config.run_timeout, Duration::from_secs(90));
        assert_eq!(config.hourly_output_mode, Some(HourlyOutputMode::FilerefOnly));
        assert!(!config.metrics_enabled);
        let nomad = config.nomad.unwrap();
        assert_eq!(nomad.address, "http://nomad:4646");
        assert_eq!(nomad.namespace, "sims");
        assert_eq!(nomad.job_id, "ep-worker");
        assert_eq!(nomad.region, "global");
    }

    #[test]
    fn test_config_rejects_unparsable() {
        let err = FanoutConfig::from_lookup(lookup(&[("FANOUT_SUBMIT_CONCURRENCY", "many")])).unwrap_err();
        assert!(err.to_string().contains("FANOUT_SUBMIT_CONCURRENCY"));

        let err = FanoutConfig::from_lookup(lookup(&[("FANOUT_HOURLY_OUTPUT_MODE", "bogus")])).unwrap_err();
        assert!(matches!(err, FanoutError::InvalidConfiguration(_)));
    }
}
