//! Nomad backend
//!
//! ## Table of Contents
//! - **NomadConfig**: API address, token, namespace and parameterized job id
//! - **NomadBackend**: Dispatches one child job per branch
//! - **DispatchPayload**: What a dispatched worker receives
//! - **run_dispatched**: Worker-side entry point
//!
//! Branches are dispatched against a pre-registered parameterized batch job.
//! Descriptors that fit Nomad's dispatch payload limit travel inline; larger
//! ones are staged in the object store and referenced by path. Workers upload
//! their `PartialResult` to the object store, where `result` reads it back.

use super::OrchestrationBackend;
use crate::error::{BackendError, FanoutError, Result};
use crate::job::{TaskDescriptor, TaskHandle, TaskStatus};
use crate::storage::object::{join_path, BoxedObjectStore, ObjectStore};
use crate::types::RunName;
use crate::worker::{PartialResult, WorkerRunner};
use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Nomad's limit on dispatch payloads
pub const DISPATCH_PAYLOAD_LIMIT: usize = 16 * 1024;

const META_RUN: &str = "fanout_run";
const META_BRANCH: &str = "fanout_branch";
const META_SUBMISSION: &str = "fanout_submission";

/// Nomad connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NomadConfig {
    /// API address, e.g. `http://localhost:4646`
    pub address: String,
    /// ACL token
    #[serde(skip_serializing)]
    pub token: Option<String>,
    /// Namespace
    pub namespace: String,
    /// Region
    pub region: String,
    /// Parameterized job to dispatch
    pub job_id: String,
    /// HTTP timeout
    pub request_timeout: Duration,
}

impl Default for NomadConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:4646".to_string(),
            token: None,
            namespace: "default".to_string(),
            region: "global".to_string(),
            job_id: "bem-simulate".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Payload handed to a dispatched worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum DispatchPayload {
    /// Descriptor carried in the payload itself
    Inline(TaskDescriptor),
    /// Descriptor staged in the object store
    Staged {
        /// Object path of the descriptor JSON
        path: String,
    },
}

/// Backend dispatching parameterized Nomad jobs
#[derive(Clone)]
pub struct NomadBackend {
    client: Client,
    config: NomadConfig,
    store: BoxedObjectStore,
    prefix: String,
}

impl NomadBackend {
    /// Create a backend
    ///
    /// `store` and `prefix` must match what the workers upload to.
    pub fn new(config: NomadConfig, store: BoxedObjectStore, prefix: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| FanoutError::config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config: NomadConfig {
                address: config.address.trim_end_matches('/').to_string(),
                ..config
            },
            store,
            prefix: prefix.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/v1{}?namespace={}&region={}",
            self.config.address, path, self.config.namespace, self.config.region
        )
    }

    fn add_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => req.header("X-Nomad-Token", token),
            None => req,
        }
    }

    /// Check Nomad connectivity
    pub async fn health(&self) -> std::result::Result<bool, BackendError> {
        let resp = self
            .add_auth(self.client.get(self.url("/status/leader")))
            .send()
            .await?;
        Ok(resp.status().is_success())
    }

    /// Build the dispatch request for a descriptor, staging it when too large
    async fn dispatch_request(&self, descriptor: &TaskDescriptor) -> Result<DispatchRequest> {
        let inline = serde_json::to_vec(&DispatchPayload::Inline(descriptor.clone()))?;
        let payload = if inline.len() <= DISPATCH_PAYLOAD_LIMIT {
            inline
        } else {
            let path = staged_descriptor_path(
                &self.prefix,
                &descriptor.branch.run,
                &descriptor.submission,
                descriptor.branch.index,
            );
            match self
                .store
                .write_object(&path, descriptor.to_payload()?.into())
                .await
            {
                Ok(()) | Err(FanoutError::VersionCollision { .. }) => {}
                Err(e) => return Err(e),
            }
            debug!(path = %path, bytes = inline.len(), "Descriptor staged in object store");
            serde_json::to_vec(&DispatchPayload::Staged { path })?
        };

        Ok(DispatchRequest {
            payload: base64::engine::general_purpose::STANDARD.encode(payload),
            meta: HashMap::from([
                (META_RUN.to_string(), descriptor.branch.run.to_string()),
                (META_BRANCH.to_string(), descriptor.branch.index.to_string()),
                (META_SUBMISSION.to_string(), descriptor.submission.clone()),
            ]),
            idempotency_token: descriptor.idempotency_key.clone(),
        })
    }

    async fn allocations(&self, handle: &TaskHandle) -> std::result::Result<Vec<AllocationListStub>, BackendError> {
        let resp = self
            .add_auth(
                self.client
                    .get(self.url(&format!("/job/{}/allocations", escape_job_id(handle.as_str())))),
            )
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn job_meta(&self, handle: &TaskHandle) -> std::result::Result<JobMeta, BackendError> {
        let resp = self
            .add_auth(self.client.get(self.url(&format!("/job/{}", escape_job_id(handle.as_str())))))
            .send()
            .await?
            .error_for_status()?;
        let job: DispatchedJob = resp.json().await?;
        let meta = job.meta.unwrap_or_default();

        let run = meta
            .get(META_RUN)
            .ok_or_else(|| BackendError::permanent(format!("job {} has no run metadata", handle)))
            .and_then(|r| RunName::new(r.as_str()).map_err(|e| BackendError::permanent(e.to_string())))?;
        let branch = meta
            .get(META_BRANCH)
            .and_then(|b| b.parse().ok())
            .ok_or_else(|| BackendError::permanent(format!("job {} has no branch metadata", handle)))?;
        let submission = meta.get(META_SUBMISSION).cloned().unwrap_or_default();
        Ok(JobMeta {
            run,
            submission,
            branch,
        })
    }
}

#[async_trait]
impl OrchestrationBackend for NomadBackend {
    async fn submit(&self, descriptor: &TaskDescriptor) -> std::result::Result<TaskHandle, BackendError> {
        let request = self
            .dispatch_request(descriptor)
            .await
            .map_err(|e| BackendError::transient(e.to_string()))?;

        let resp = self
            .add_auth(
                self.client
                    .post(self.url(&format!("/job/{}/dispatch", self.config.job_id))),
            )
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        let dispatched: DispatchResponse = resp.json().await?;

        info!(
            job = %self.config.job_id,
            dispatched = %dispatched.dispatched_job_id,
            eval = %dispatched.eval_id,
            key = %descriptor.idempotency_key,
            "Branch dispatched to Nomad"
        );
        Ok(TaskHandle::new(dispatched.dispatched_job_id))
    }

    async fn status(&self, handle: &TaskHandle) -> std::result::Result<TaskStatus, BackendError> {
        let allocations = self.allocations(handle).await?;
        Ok(status_from_allocations(&allocations))
    }

    async fn result(&self, handle: &TaskHandle) -> std::result::Result<PartialResult, BackendError> {
        match self.status(handle).await? {
            TaskStatus::Completed => {}
            TaskStatus::Failed => {
                let allocations = self.allocations(handle).await?;
                return Err(BackendError::permanent(failure_reason(&allocations)));
            }
            other => {
                return Err(BackendError::transient(format!("task {} is {}", handle, other)));
            }
        }

        let meta = self.job_meta(handle).await?;
        PartialResult::download(
            self.store.as_ref(),
            &self.prefix,
            &meta.run,
            &meta.submission,
            meta.branch,
        )
            .await
            .map_err(|e| match e {
                FanoutError::NotFound(_) => BackendError::permanent(format!(
                    "task {} completed without uploading a result",
                    handle
                )),
                other => BackendError::transient(other.to_string()),
            })
    }

    fn name(&self) -> &str {
        "nomad"
    }
}

/// Object path of a staged descriptor
pub fn staged_descriptor_path(prefix: &str, run: &RunName, submission: &str, branch_index: usize) -> String {
    let file = format!("branch-{:06}.json", branch_index);
    join_path([prefix, run.as_str(), "_tasks", submission, file.as_str()])
}

/// Dispatched job ids contain `/`, which must be escaped in paths
fn escape_job_id(id: &str) -> String {
    id.replace('/', "%2F")
}

/// Worker-side entry point for a dispatched job
///
/// `payload` is the raw dispatch payload as Nomad writes it into the task
/// directory. Returns the object path of the uploaded result.
pub async fn run_dispatched(
    runner: &WorkerRunner,
    store: &dyn ObjectStore,
    prefix: &str,
    payload: &[u8],
) -> Result<String> {
    let descriptor = match serde_json::from_slice::<DispatchPayload>(payload)? {
        DispatchPayload::Inline(descriptor) => descriptor,
        DispatchPayload::Staged { path } => TaskDescriptor::from_payload(&store.read_object(&path).await?)?,
    };
    let result = runner.run_descriptor(&descriptor).await;
    result.upload(store, prefix).await
}

/// Map a dispatched job's allocations to a task status
pub fn status_from_allocations(allocations: &[AllocationListStub]) -> TaskStatus {
    if allocations.iter().any(|a| a.client_status == "complete") {
        return TaskStatus::Completed;
    }
    if allocations.iter().any(|a| a.client_status == "running") {
        return TaskStatus::Running;
    }
    // a pending replacement keeps the task alive
    let all_dead = !allocations.is_empty()
        && allocations
            .iter()
            .all(|a| matches!(a.client_status.as_str(), "failed" | "lost"));
    if all_dead {
        TaskStatus::Failed
    } else {
        TaskStatus::Pending
    }
}

fn failure_reason(allocations: &[AllocationListStub]) -> String {
    let statuses: Vec<String> = allocations
        .iter()
        .map(|a| format!("{}={}", a.id.chars().take(8).collect::<String>(), a.client_status))
        .collect();
    format!("all allocations failed ({})", statuses.join(", "))
}

/// Run coordinates a dispatched job was tagged with
struct JobMeta {
    run: RunName,
    submission: String,
    branch: usize,
}

// Nomad API types

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DispatchRequest {
    payload: String,
    meta: HashMap<String, String>,
    idempotency_token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DispatchResponse {
    #[serde(rename = "DispatchedJobID")]
    dispatched_job_id: String,
    #[serde(rename = "EvalID", default)]
    eval_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DispatchedJob {
    meta: Option<HashMap<String, String>>,
}

/// Allocation list stub
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AllocationListStub {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "JobID")]
    pub job_id: String,
    pub client_status: String,
    pub desired_status: String,
}
