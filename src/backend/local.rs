//! In-process backend
//!
//! Each submitted branch runs as a tokio task executing a [`WorkerRunner`].
//! A worker panic or an exceeded task timeout marks the task failed.

use super::OrchestrationBackend;
use crate::error::BackendError;
use crate::job::{TaskDescriptor, TaskHandle, TaskStatus};
use crate::worker::{PartialResult, WorkerRunner};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct LocalTask {
    status: TaskStatus,
    outcome: Option<Result<PartialResult, String>>,
}

/// Backend running branches on the local tokio runtime
pub struct LocalBackend {
    runner: WorkerRunner,
    tasks: DashMap<TaskHandle, Arc<Mutex<LocalTask>>>,
    by_key: DashMap<String, TaskHandle>,
    slots: Arc<Semaphore>,
    task_timeout: Option<Duration>,
}

impl LocalBackend {
    /// Create a backend running up to `parallelism` branches at once
    pub fn new(runner: WorkerRunner, parallelism: usize) -> Self {
        Self {
            runner,
            tasks: DashMap::new(),
            by_key: DashMap::new(),
            slots: Arc::new(Semaphore::new(parallelism.max(1))),
            task_timeout: None,
        }
    }

    /// Fail branches that run longer than `timeout`
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    /// Number of tasks accepted so far
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    fn entry(&self, handle: &TaskHandle) -> Result<Arc<Mutex<LocalTask>>, BackendError> {
        self.tasks
            .get(handle)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| BackendError::permanent(format!("unknown task {}", handle)))
    }
}

#[async_trait]
impl OrchestrationBackend for LocalBackend {
    async fn submit(&self, descriptor: &TaskDescriptor) -> Result<TaskHandle, BackendError> {
        let handle = match self.by_key.entry(descriptor.idempotency_key.clone()) {
            Entry::Occupied(existing) => {
                debug!(key = %descriptor.idempotency_key, handle = %existing.get(), "Duplicate submission");
                return Ok(existing.get().clone());
            }
            Entry::Vacant(slot) => {
                let handle = TaskHandle::new(format!("local-{}", uuid::Uuid::new_v4()));
                slot.insert(handle.clone());
                handle
            }
        };
        let state = Arc::new(Mutex::new(LocalTask {
            status: TaskStatus::Pending,
            outcome: None,
        }));
        self.tasks.insert(handle.clone(), Arc::clone(&state));
        info!(handle = %handle, key = %descriptor.idempotency_key, "Local task accepted");

        let runner = self.runner.clone();
        let slots = Arc::clone(&self.slots);
        let timeout = self.task_timeout;
        let descriptor = descriptor.clone();
        let task_handle = handle.clone();

        tokio::spawn(async move {
            let _permit = match slots.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    let mut s = state.lock();
                    s.status = TaskStatus::Failed;
                    s.outcome = Some(Err("backend shut down".to_string()));
                    return;
                }
            };
            state.lock().status = TaskStatus::Running;

            // run in its own task so a panicking engine only fails this branch
            let work = tokio::spawn(async move { runner.run_descriptor(&descriptor).await });
            let joined = match timeout {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(joined) => joined.map_err(|e| format!("worker crashed: {}", e)),
                    Err(_) => Err(format!("worker exceeded {}s", limit.as_secs_f64())),
                },
                None => work.await.map_err(|e| format!("worker crashed: {}", e)),
            };

            let mut s = state.lock();
            match joined {
                Ok(partial) => {
                    s.status = TaskStatus::Completed;
                    s.outcome = Some(Ok(partial));
                }
                Err(reason) => {
                    warn!(handle = %task_handle, reason = %reason, "Local task failed");
                    s.status = TaskStatus::Failed;
                    s.outcome = Some(Err(reason));
                }
            }
        });

        Ok(handle)
    }

    async fn status(&self, handle: &TaskHandle) -> Result<TaskStatus, BackendError> {
        let entry = self.entry(handle)?;
        let status = entry.lock().status;
        Ok(status)
    }

    async fn result(&self, handle: &TaskHandle) -> Result<PartialResult, BackendError> {
        let entry = self.entry(handle)?;
        let task = entry.lock();
        match &task.outcome {
            Some(Ok(partial)) => Ok(partial.clone()),
            Some(Err(reason)) => Err(BackendError::permanent(reason.clone())),
            None => Err(BackendError::transient(format!("task {} has not finished", handle))),
        }
    }

    fn name(&self) -> &str {
        "local"
    }
}
