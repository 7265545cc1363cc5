//! # BEM Fanout
//!
//! Fan-out, aggregation and versioning core for large building-energy
//! simulation runs. A manifest of building specs is split into bounded
//! branches, each branch runs as one task on an orchestration backend, and
//! the partial results are merged and published as an immutable,
//! semantically versioned experiment.
//!
//! ## Features
//!
//! - **Branch Planning**: Greedy partitioning under a payload budget
//! - **Submission**: Concurrent, retried, resumable via a persisted ledger
//! - **Backends**: Nomad parameterized batch jobs or in-process tokio tasks
//! - **Aggregation**: Backoff polling, partial-failure tolerant merging
//! - **Versioning**: Create-if-absent publishes with a manifest commit marker
//! - **Storage**: Memory, filesystem or S3 (feature `s3`) object stores
//! - **Metrics**: Prometheus-compatible metrics export
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bem_fanout::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> bem_fanout::Result<()> {
//!     bem_fanout::telemetry::init();
//!
//!     let fanout = FanoutBuilder::new()
//!         .with_engine(Arc::new(SyntheticEngine))
//!         .with_object_root("./experiments")
//!         .build()?;
//!
//!     let manifest = ExperimentSpec::from_path("manifest.yml")?;
//!     let experiment = fanout.run_manifest(&manifest, &CancelSignal::never()).await?;
//!     fanout.fetch(&experiment.run, None, "./out").await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod aggregator;
pub mod backend;
pub mod builder;
pub mod error;
pub mod fetcher;
pub mod frame;
pub mod job;
pub mod ledger;
pub mod metrics;
pub mod planner;
pub mod resilience;
pub mod runtime;
pub mod spec;
pub mod storage;
pub mod submitter;
pub mod telemetry;
pub mod types;
pub mod versioning;
pub mod worker;

// Re-exports for ergonomic API
pub use aggregator::{AggregatedResult, IncompleteBranch, PollConfig, ResultAggregator};
pub use backend::{BoxedBackend, LocalBackend, NomadBackend, NomadConfig, OrchestrationBackend};
pub use builder::{FanoutBuilder, FanoutConfig};
pub use error::{BackendError, FanoutError, Result};
pub use fetcher::{FetchRequest, ResultFetcher};
pub use frame::DataFrame;
pub use job::{Task, TaskDescriptor, TaskHandle, TaskStatus};
pub use ledger::TaskLedger;
pub use metrics::{FanoutMetrics, SharedMetrics};
pub use planner::{Branch, BranchPlanner};
pub use resilience::{CancelHandle, CancelSignal, RetryConfig};
pub use runtime::{Fanout, SubmittedRun};
pub use spec::{BuildingSpec, ExperimentSpec, HourlyDataConfig, HourlyOutputMode};
pub use storage::{
    BoxedObjectStore, FileStore, LocalObjectStore, MemoryObjectStore, MemoryStore, ObjectStore,
    S3Config, StateStore,
};
pub use submitter::JobSubmitter;
pub use types::{RunName, SemVer, SpecId, VersionBump};
pub use versioning::{ExperimentVersioner, VersionedExperiment};
pub use worker::{
    ErrorKind, PartialResult, SimulationEngine, SpecFailure, SpecOutcome, SyntheticEngine,
    WorkerRunner,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::builder::FanoutBuilder;
    pub use crate::error::Result;
    pub use crate::resilience::CancelSignal;
    pub use crate::runtime::Fanout;
    pub use crate::spec::{BuildingSpec, ExperimentSpec};
    pub use crate::types::{RunName, SemVer, VersionBump};
    pub use crate::worker::{SimulationEngine, SyntheticEngine};
}
