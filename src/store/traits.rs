//! Backend-agnostic `Database` trait for task persistence.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::tasks::model::Task;

/// Durable storage for task records, keyed by task id.
///
/// `upsert_task` must be atomic: a reader sees either the previous or the new
/// snapshot of a task, never a partial write. The engine relies on this for
/// its status-plus-log commit guarantee.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Insert or fully replace a task record.
    async fn upsert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Get a task by id.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// All task records, hidden ones included, most recently updated first.
    async fn list_tasks(&self) -> Result<Vec<Task>, DatabaseError>;

    /// Non-terminal tasks — the scheduler's working set.
    async fn list_open_tasks(&self) -> Result<Vec<Task>, DatabaseError>;
}
