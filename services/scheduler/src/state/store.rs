//! Typed task, identity and snapshot records over a [`KvStore`].
//!
//! Key layout, all under the framework name:
//!
//! - `<fw>:<role>:<task-id>` one JSON [`Task`] per launched task
//! - `<fw>:framework` the [`FrameworkIdentity`]
//! - `<fw>:framework_config` the latest [`ConfigSnapshot`]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use halyard_id::TaskId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use super::kv::{KvError, KvStore};
use crate::task::{ConfigSnapshot, FrameworkIdentity, Role, Task};

/// Errors from task store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(#[from] KvError),

    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),

    #[error("record {key} could not be encoded or decoded: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Typed access to scheduler state.
#[derive(Clone)]
pub struct TaskStore {
    kv: Arc<dyn KvStore>,
    namespace: String,
    timeout: Duration,
}

impl TaskStore {
    /// `namespace` is the framework name; `timeout` bounds every call.
    pub fn new(kv: Arc<dyn KvStore>, namespace: impl Into<String>, timeout: Duration) -> Self {
        Self {
            kv,
            namespace: namespace.into(),
            timeout,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn task_key(&self, role: Role, id: &TaskId) -> String {
        format!("{}:{}:{}", self.namespace, role, id)
    }

    fn role_prefix(&self, role: Role) -> String {
        format!("{}:{}:", self.namespace, role)
    }

    fn identity_key(&self) -> String {
        format!("{}:framework", self.namespace)
    }

    fn snapshot_key(&self) -> String {
        format!("{}:framework_config", self.namespace)
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, KvError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let Some(raw) = self.bounded(self.kv.get(key)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Codec {
                key: key.to_string(),
                source,
            })
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value).map_err(|source| StoreError::Codec {
            key: key.to_string(),
            source,
        })?;
        self.bounded(self.kv.set(key, &raw)).await
    }

    pub async fn get_task(&self, role: Role, id: &TaskId) -> Result<Option<Task>, StoreError> {
        self.read(&self.task_key(role, id)).await
    }

    /// Look a task up in every role namespace.
    pub async fn find_task(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        for role in Role::ALL {
            if let Some(task) = self.get_task(role, id).await? {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    pub async fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        self.write(&self.task_key(task.role, &task.id), task).await
    }

    pub async fn delete_task(&self, role: Role, id: &TaskId) -> Result<(), StoreError> {
        self.bounded(self.kv.delete(&self.task_key(role, id))).await
    }

    /// Every task of a role, oldest first (creation time, then id).
    ///
    /// Records that fail to decode are logged and skipped.
    pub async fn list_tasks(&self, role: Role) -> Result<Vec<Task>, StoreError> {
        let cursor = self.bounded(self.kv.scan_prefix(&self.role_prefix(role))).await?;

        let mut tasks: Vec<Task> = cursor
            .filter_map(|(key, raw)| match serde_json::from_str::<Task>(&raw) {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping undecodable task record");
                    None
                }
            })
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    /// Tasks of every role.
    pub async fn all_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks = Vec::new();
        for role in Role::ALL {
            tasks.extend(self.list_tasks(role).await?);
        }
        Ok(tasks)
    }

    /// Observed count: non-terminal tasks in the role namespace.
    pub async fn count_running(&self, role: Role) -> Result<usize, StoreError> {
        Ok(self
            .list_tasks(role)
            .await?
            .iter()
            .filter(|t| !t.is_terminal())
            .count())
    }

    /// Raw entry count in the role namespace, terminal records included.
    pub async fn count_records(&self, role: Role) -> Result<usize, StoreError> {
        self.bounded(self.kv.count_prefix(&self.role_prefix(role)))
            .await
    }

    pub async fn load_identity(&self) -> Result<Option<FrameworkIdentity>, StoreError> {
        self.read(&self.identity_key()).await
    }

    pub async fn save_identity(&self, identity: &FrameworkIdentity) -> Result<(), StoreError> {
        self.write(&self.identity_key(), identity).await
    }

    pub async fn load_snapshot(&self) -> Result<Option<ConfigSnapshot>, StoreError> {
        self.read(&self.snapshot_key()).await
    }

    pub async fn save_snapshot(&self, snapshot: &ConfigSnapshot) -> Result<(), StoreError> {
        self.write(&self.snapshot_key(), snapshot).await
    }
}
