//! Task service — the injectable facade the UI layer talks to.
//!
//! Owns the store, the execution engine, the approval gate, the scheduler
//! handle, and the event broadcast. Nothing here lives in ambient globals;
//! construct one and pass it around.

use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use super::engine::ExecutionEngine;
use super::gate::PendingMessageGate;
use super::locks::TaskLocks;
use super::model::{PollFrequency, Task, TaskEvent};
use super::scheduler::{self, SchedulerHandle};
use crate::config::EngineConfig;
use crate::error::{Result, TaskError};
use crate::providers::{Decomposition, MessageSender, StepExecutor};
use crate::store::Database;

/// Broadcast capacity for task events.
const EVENT_CAPACITY: usize = 256;

pub struct TaskService {
    config: EngineConfig,
    store: Arc<dyn Database>,
    engine: Arc<ExecutionEngine>,
    gate: PendingMessageGate,
    scheduler: SchedulerHandle,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskService {
    /// Wire up the engine, gate, and scheduler over the given collaborators.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn Database>,
        executor: Arc<dyn StepExecutor>,
        sender: Arc<dyn MessageSender>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let locks = TaskLocks::new();

        let engine = Arc::new(ExecutionEngine::new(
            Arc::clone(&store),
            executor,
            Arc::clone(&sender),
            Arc::clone(&locks),
            events.clone(),
        ));
        let gate = PendingMessageGate::new(
            Arc::clone(&store),
            sender,
            Arc::clone(&locks),
            events.clone(),
        );
        let scheduler = scheduler::spawn(config.clone(), Arc::clone(&store), Arc::clone(&engine));

        Arc::new(Self {
            config,
            store,
            engine,
            gate,
            scheduler,
            events,
        })
    }

    /// Subscribe to task events. Each UI client calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Task lifecycle ──────────────────────────────────────────────

    /// Create a task from a decomposition. The original request must be the
    /// last user-authored message before decomposition, verbatim.
    pub async fn create_task(
        &self,
        decomposition: Decomposition,
        original_request: &str,
        poll_frequency: Option<PollFrequency>,
        auto_send: bool,
    ) -> Result<Task> {
        let frequency =
            poll_frequency.unwrap_or_else(|| self.config.default_poll_frequency.clone());
        self.engine
            .create_task(decomposition, original_request, frequency, auto_send)
            .await
    }

    /// Visible tasks, most recently updated first.
    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        let tasks = self.store.list_tasks().await?;
        Ok(tasks.into_iter().filter(|t| !t.hidden).collect())
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| TaskError::NotFound { id: task_id }.into())
    }

    /// Execute a task immediately, bypassing its timer. Silently ignored if
    /// the task is already executing.
    pub async fn run_now(&self, task_id: Uuid) -> Result<()> {
        // Surface NotFound to the caller; the actual run is asynchronous.
        self.get_task(task_id).await?;
        self.scheduler.run_now(task_id).await;
        Ok(())
    }

    pub async fn cancel_task(&self, task_id: Uuid) -> Result<Task> {
        self.engine.cancel(task_id).await
    }

    pub async fn hide_task(&self, task_id: Uuid) -> Result<Task> {
        self.engine.hide(task_id).await
    }

    pub async fn set_auto_send(&self, task_id: Uuid, enabled: bool) -> Result<Task> {
        self.engine.set_auto_send(task_id, enabled).await
    }

    pub async fn set_poll_frequency(
        &self,
        task_id: Uuid,
        frequency: PollFrequency,
    ) -> Result<Task> {
        self.engine.set_poll_frequency(task_id, frequency).await
    }

    /// Record a user-supplied fact for a task waiting on input.
    pub async fn provide_input(&self, task_id: Uuid, key: &str, value: &str) -> Result<Task> {
        self.engine.provide_input(task_id, key, value).await
    }

    // ── Approval gate ───────────────────────────────────────────────

    pub async fn approve_message(
        &self,
        task_id: Uuid,
        message_id: Uuid,
        edited_body: Option<String>,
    ) -> Result<Task> {
        self.gate.approve(task_id, message_id, edited_body).await
    }

    pub async fn reject_message(&self, task_id: Uuid, message_id: Uuid) -> Result<Task> {
        self.gate.reject(task_id, message_id).await
    }

    /// Stop the scheduler loop. In-flight steps finish on their own.
    pub async fn shutdown(self: Arc<Self>) {
        if let Ok(service) = Arc::try_unwrap(self) {
            service.scheduler.shutdown().await;
        }
    }
}
