//! Resource store and destination sink collaborators

use crate::error::CredsyncResult;
use crate::task::SyncTask;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Persists task declarations' status and lifecycle guards
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Add the teardown finalizer so the task can't disappear before cleanup
    async fn add_finalizer(&self, task: &SyncTask) -> CredsyncResult<()>;

    /// Release the teardown finalizer
    async fn remove_finalizer(&self, task: &SyncTask) -> CredsyncResult<()>;

    /// Persist `task.status` and the kind-specific status
    async fn update_status(&self, task: &SyncTask) -> CredsyncResult<()>;
}

/// The target key/value store synced data lands in
#[async_trait]
pub trait SecretSink: Send + Sync {
    async fn exists(&self, namespace: &str, name: &str) -> CredsyncResult<bool>;

    /// Apply the task's transformations to fetched data
    fn render(
        &self,
        _task: &SyncTask,
        data: &Map<String, Value>,
    ) -> CredsyncResult<Map<String, Value>> {
        Ok(data.clone())
    }

    async fn write(&self, task: &SyncTask, data: &Map<String, Value>) -> CredsyncResult<()>;
}
