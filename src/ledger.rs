//! Persisted run → branch → task mapping
//!
//! The ledger lets a restarted submitter skip branches the backend already
//! accepted, and gives the aggregator the handles to poll. Records are keyed
//! by `(run, branch_index)`.

use crate::error::Result;
use crate::job::Task;
use crate::storage::state::{keys, store_get_json, store_set_json, BoxedStateStore};
use crate::types::RunName;
use tracing::debug;

/// Task ledger over a [`StateStore`](crate::storage::StateStore)
#[derive(Clone)]
pub struct TaskLedger {
    store: BoxedStateStore,
}

impl TaskLedger {
    /// Create a ledger over a state store
    pub fn new(store: BoxedStateStore) -> Self {
        Self { store }
    }

    /// Insert or replace a task record
    pub async fn upsert(&self, task: &Task) -> Result<()> {
        let key = keys::task(task.run.as_str(), task.branch_index);
        store_set_json(self.store.as_ref(), &key, task).await?;
        debug!(run = %task.run, branch = task.branch_index, status = %task.status, "Ledger updated");
        Ok(())
    }

    /// Look up one branch's task
    pub async fn get(&self, run: &RunName, branch_index: usize) -> Result<Option<Task>> {
        store_get_json(self.store.as_ref(), &keys::task(run.as_str(), branch_index)).await
    }

    /// Every task of a run, ordered by branch index
    pub async fn list_run(&self, run: &RunName) -> Result<Vec<Task>> {
        let prefix = keys::run_tasks(run.as_str());
        let mut tasks = Vec::new();
        for key in self.store.list_prefix(&prefix).await? {
            // nested runs share the prefix
            if key[prefix.len()..].contains('/') {
                continue;
            }
            if let Some(task) = store_get_json::<Task>(self.store.as_ref(), &key).await? {
                tasks.push(task);
            }
        }
        tasks.sort_by_key(|t| t.branch_index);
        Ok(tasks)
    }

    /// Drop every record of a run
    pub async fn clear_run(&self, run: &RunName) -> Result<usize> {
        let tasks = self.list_run(run).await?;
        for task in &tasks {
            self.store
                .delete(&keys::task(run.as_str(), task.branch_index))
                .await?;
        }
        Ok(tasks.len())
    }
}
