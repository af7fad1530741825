//! Per-task mutation locks.
//!
//! Every mutation of a task record (step execution, approval resolution,
//! cancellation, settings changes) runs under that task's lock, so concurrent
//! callers serialize per task while distinct tasks proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Registry of per-task mutexes, created on first use.
#[derive(Default)]
pub struct TaskLocks {
    inner: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl TaskLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire the lock for a task, waiting if another mutation holds it.
    pub async fn acquire(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            Arc::clone(map.entry(id).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry for a task that reached a terminal status.
    pub async fn release(&self, id: Uuid) {
        self.inner.lock().await.remove(&id);
    }
}
