//! Task definitions for branch execution
//!
//! ## Table of Contents
//! - **TaskDescriptor**: Serialized unit of work sent to the backend (one branch)
//! - **new_submission_id**: Fresh id separating one submission of a run from the next
//! - **TaskHandle**: Backend-assigned identifier of a submitted task
//! - **TaskStatus**: Pending / Running / Completed / Failed
//! - **Task**: Local record tying a branch to its handle and status

use crate::planner::Branch;
use crate::spec::HourlyDataConfig;
use crate::types::RunName;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend-assigned identifier of a submitted task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(String);

impl TaskHandle {
    /// Wrap a backend id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Accepted, not yet running (or not yet submitted)
    Pending,
    /// A worker picked it up
    Running,
    /// Worker produced a partial result
    Completed,
    /// Worker crashed, timed out, or submission never succeeded
    Failed,
}

impl TaskStatus {
    /// Whether no further transitions will happen
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Unit of work handed to the orchestration backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Branch to execute
    pub branch: Branch,
    /// Hourly capture requested for this run
    pub hourly: HourlyDataConfig,
    /// Submission this task belongs to
    pub submission: String,
    /// Deduplication key for at-least-once backends
    pub idempotency_key: String,
    /// Creation timestamp
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl TaskDescriptor {
    /// Build a descriptor for a branch of one submission
    pub fn new(branch: Branch, hourly: HourlyDataConfig, submission: impl Into<String>) -> Self {
        let submission = submission.into();
        let idempotency_key = idempotency_key(&branch.run, &submission, branch.index);
        Self {
            branch,
            hourly,
            submission,
            idempotency_key,
            created_at: chrono::Utc::now(),
        }
    }

    /// Serialize to the wire payload
    pub fn to_payload(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a wire payload
    pub fn from_payload(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Stable idempotency key for a branch of one submission of a run
pub fn idempotency_key(run: &RunName, submission: &str, branch_index: usize) -> String {
    format!("{}#{}#{}", run, submission, branch_index)
}

/// Fresh submission id: UTC timestamp plus a random suffix, sortable by time
pub fn new_submission_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S"),
        &suffix[..8]
    )
}

/// Local record of one branch's task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Parent run
    pub run: RunName,
    /// Branch index within the run
    pub branch_index: usize,
    /// Submission the task was created by
    #[serde(default)]
    pub submission: String,
    /// Number of specs in the branch
    pub spec_count: usize,
    /// Backend handle, absent if submission never succeeded
    pub handle: Option<TaskHandle>,
    /// Last known status
    pub status: TaskStatus,
    /// Failure reason, set when `status` is `Failed`
    pub failure: Option<String>,
    /// Submission attempts made
    pub attempts: u32,
}

impl Task {
    /// A task accepted by the backend
    pub fn accepted(branch: &Branch, handle: TaskHandle, attempts: u32) -> Self {
        Self {
            run: branch.run.clone(),
            branch_index: branch.index,
            submission: String::new(),
            spec_count: branch.specs.len(),
            handle: Some(handle),
            status: TaskStatus::Pending,
            failure: None,
            attempts,
        }
    }

    /// A task whose submission failed locally
    pub fn submission_failed(branch: &Branch, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            run: branch.run.clone(),
            branch_index: branch.index,
            submission: String::new(),
            spec_count: branch.specs.len(),
            handle: None,
            status: TaskStatus::Failed,
            failure: Some(reason.into()),
            attempts,
        }
    }

    /// Tag the record with its submission
    pub fn with_submission(mut self, submission: impl Into<String>) -> Self {
        self.submission = submission.into();
        self
    }

    /// Idempotency key of this task
    pub fn idempotency_key(&self) -> String {
        idempotency_key(&self.run, &self.submission, self.branch_index)
    }

    /// Whether the backend accepted this task
    pub fn is_submitted(&self) -> bool {
        self.handle.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::BuildingSpec;

    fn branch() -> Branch {
        Branch {
            run: RunName::new("city/base").unwrap(),
            index: 2,
            specs: vec![BuildingSpec::new("b-1", 10.0, 10.0, 1, "w.zip")],
            payload_bytes: 100,
        }
    }

    #[test]
    fn test_descriptor_payload() {
        let descriptor = TaskDescriptor::new(branch(), HourlyDataConfig::default(), "s1");
        assert_eq!(descriptor.idempotency_key, "city/base#s1#2");

        let bytes = descriptor.to_payload().unwrap();
        let parsed = TaskDescriptor::from_payload(&bytes).unwrap();
        assert_eq!(parsed.branch.index, 2);
        assert_eq!(parsed.branch.specs.len(), 1);
    }

    #[test]
    fn test_task_records() {
        let b = branch();
        let ok = Task::accepted(&b, TaskHandle::new("h-1"), 1);
        assert!(ok.is_submitted());
        assert_eq!(ok.status, TaskStatus::Pending);
        assert!(!ok.status.is_terminal());

        let failed = Task::submission_failed(&b, "backend unreachable", 4).with_submission("s1");
        assert!(!failed.is_submitted());
        assert!(failed.status.is_terminal());
        assert_eq!(failed.idempotency_key(), "city/base#s1#2");
    }

    #[test]
    fn test_submission_ids_differ() {
        let a = new_submission_id();
        let b = new_submission_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), "20261019T120000-".len() + 8);
        assert!(!a.contains('/'));
    }
}
