//! Orchestration backends
//!
//! ## Table of Contents
//! - **OrchestrationBackend**: Submit / status / result contract
//! - **NomadBackend**: Dispatches a parameterized Nomad batch job per branch
//! - **LocalBackend**: Runs branches as in-process tokio tasks
//!
//! Delivery is at least once: `submit` carries the descriptor's idempotency
//! key and backends deduplicate on it where they can.

pub mod local;
pub mod nomad;

use crate::error::BackendError;
use crate::job::{TaskDescriptor, TaskHandle, TaskStatus};
use crate::worker::PartialResult;
use async_trait::async_trait;
use std::sync::Arc;

pub use local::LocalBackend;
pub use nomad::{NomadBackend, NomadConfig};

/// Workflow-orchestration backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrchestrationBackend: Send + Sync {
    /// Submit one branch, returning the backend's handle
    async fn submit(&self, descriptor: &TaskDescriptor) -> Result<TaskHandle, BackendError>;

    /// Current status of a task
    async fn status(&self, handle: &TaskHandle) -> Result<TaskStatus, BackendError>;

    /// Result of a terminal task
    ///
    /// A failed task yields `BackendError::Permanent` carrying the failure
    /// reason.
    async fn result(&self, handle: &TaskHandle) -> Result<PartialResult, BackendError>;

    /// Backend name for logging
    fn name(&self) -> &str;
}

/// Shared backend
pub type BoxedBackend = Arc<dyn OrchestrationBackend>;
