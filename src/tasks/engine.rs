//! Execution engine — advances a task by one logical step.
//!
//! `step()` invokes the external step executor, interprets its structured
//! outcome, and commits the resulting status transition together with its
//! execution-log line in a single store upsert. Context-memory deltas are
//! committed before the approval gate is consulted, so an approval decision
//! always sees the latest facts.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::gate::PendingMessageGate;
use super::locks::TaskLocks;
use super::model::{PollFrequency, Task, TaskEvent};
use super::state::TaskStatus;
use crate::error::{Error, Result, TaskError};
use crate::providers::{Decomposition, MessageSender, StepExecutor, StepOutcome};
use crate::store::Database;

/// What a `step()` call did, for callers that care (scheduler logging, tests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepReport {
    /// The step ran and the task was re-parked or terminated.
    Executed { status: TaskStatus },
    /// The task was not in a runnable status; nothing happened.
    Skipped { status: TaskStatus },
}

pub struct ExecutionEngine {
    store: Arc<dyn Database>,
    executor: Arc<dyn StepExecutor>,
    sender: Arc<dyn MessageSender>,
    locks: Arc<TaskLocks>,
    events: broadcast::Sender<TaskEvent>,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn Database>,
        executor: Arc<dyn StepExecutor>,
        sender: Arc<dyn MessageSender>,
        locks: Arc<TaskLocks>,
        events: broadcast::Sender<TaskEvent>,
    ) -> Self {
        Self {
            store,
            executor,
            sender,
            locks,
            events,
        }
    }

    /// Create a task from a decomposition and persist it in `pending`.
    pub async fn create_task(
        &self,
        decomposition: Decomposition,
        original_request: &str,
        poll_frequency: PollFrequency,
        auto_send: bool,
    ) -> Result<Task> {
        let task = Task::from_decomposition(
            decomposition,
            original_request,
            poll_frequency,
            auto_send,
        )
        .map_err(TaskError::BadDecomposition)?;

        self.store.upsert_task(&task).await?;
        info!(task_id = %task.id, title = %task.title, "Task created");
        let _ = self.events.send(TaskEvent::TaskUpdated { task: task.clone() });
        Ok(task)
    }

    /// Advance a task by one logical step.
    ///
    /// A task already `active` (or otherwise not runnable) makes this a
    /// silent no-op — that is the at-most-one-concurrent-execution guarantee:
    /// `active` is the per-task execution lock, and the task lock serializes
    /// the status check with the flip to `active`.
    pub async fn step(&self, task_id: Uuid) -> Result<StepReport> {
        let guard = self.locks.acquire(task_id).await;
        let mut task = self.load(task_id).await?;

        match task.status {
            TaskStatus::Pending | TaskStatus::Waiting | TaskStatus::WaitingForInput => {}
            status => {
                debug!(task_id = %task_id, %status, "Step trigger ignored");
                return Ok(StepReport::Skipped { status });
            }
        }

        let step_index = task.current_step.index;
        let description = task.current_step.description.clone();
        task.transition(
            TaskStatus::Active,
            format!("Step {step_index}/{} started: {description}", task.plan.len()),
        )
        .map_err(|reason| Error::Task(TaskError::State { id: task_id, reason }))?;
        self.commit(&task).await?;

        // The task lock is held across the executor call: a cancel arriving
        // mid-step waits for the outcome to be recorded first.
        let outcome = self
            .executor
            .execute(&description, &task.context_memory, &task.original_request)
            .await;

        let report = match outcome {
            Ok(outcome) => self.apply_outcome(&mut task, outcome).await?,
            Err(e) => {
                warn!(task_id = %task_id, "Step executor error: {e}");
                task.current_step.execution_state = Some(e.to_string());
                task.park_waiting(
                    Utc::now(),
                    format!("Step {step_index} errored: {e}; will retry next check"),
                )
                .map_err(|reason| Error::Task(TaskError::State { id: task_id, reason }))?;
                self.commit(&task).await?;
                StepReport::Executed {
                    status: task.status,
                }
            }
        };

        drop(guard);
        if task.is_terminal() {
            self.locks.release(task_id).await;
        }
        Ok(report)
    }

    /// Interpret a structured step outcome into exactly one transition.
    async fn apply_outcome(&self, task: &mut Task, outcome: StepOutcome) -> Result<StepReport> {
        let task_id = task.id;
        let step_index = task.current_step.index;
        let state_err =
            |reason: String| Error::Task(TaskError::State { id: task_id, reason });

        match outcome {
            StepOutcome::Advance { summary, memory } => {
                task.context_memory.extend(memory);
                if task.on_final_step() {
                    task.transition(
                        TaskStatus::Completed,
                        format!("Step {step_index} complete: {summary}; task completed"),
                    )
                    .map_err(state_err)?;
                } else {
                    task.advance_step();
                    task.park_waiting(
                        Utc::now(),
                        format!(
                            "Step {step_index} complete: {summary}; next step {}/{}",
                            task.current_step.index,
                            task.plan.len()
                        ),
                    )
                    .map_err(state_err)?;
                }
                self.commit(task).await?;
            }

            StepOutcome::RequestApproval { draft, memory } => {
                // Memory deltas are durable before the gate sees the draft.
                task.context_memory.extend(memory);
                self.store.upsert_task(task).await?;

                if task.auto_send {
                    let sent = self
                        .sender
                        .send(
                            &draft.platform,
                            &draft.recipient,
                            draft.subject.as_deref(),
                            &draft.body,
                        )
                        .await;
                    match sent {
                        Ok(()) => {
                            let line = format!(
                                "Sent {} to {} via {} (auto-send)",
                                draft.tool_name, draft.recipient, draft.platform
                            );
                            if task.on_final_step() {
                                task.transition(
                                    TaskStatus::Completed,
                                    format!("{line}; task completed"),
                                )
                                .map_err(state_err)?;
                            } else {
                                task.advance_step();
                                task.park_waiting(
                                    Utc::now(),
                                    format!(
                                        "{line}; next step {}/{}",
                                        task.current_step.index,
                                        task.plan.len()
                                    ),
                                )
                                .map_err(state_err)?;
                            }
                        }
                        Err(e) => {
                            // Treated as a recoverable step error: keep the
                            // cadence, do not advance.
                            task.current_step.execution_state =
                                Some(format!("auto-send failed: {e}"));
                            task.park_waiting(
                                Utc::now(),
                                format!(
                                    "Auto-send to {} failed: {e}; will retry next check",
                                    draft.recipient
                                ),
                            )
                            .map_err(state_err)?;
                        }
                    }
                    self.commit(task).await?;
                } else {
                    let message = PendingMessageGate::apply_enqueue(task, draft)
                        .map_err(state_err)?;
                    self.commit(task).await?;
                    let _ = self.events.send(TaskEvent::PendingMessageAdded {
                        task_id,
                        message,
                    });
                }
            }

            StepOutcome::RequestInput { description } => {
                task.current_step.execution_state = Some(description.clone());
                task.transition(
                    TaskStatus::WaitingForInput,
                    format!("Waiting for input: {description}"),
                )
                .map_err(state_err)?;
                self.commit(task).await?;
            }

            StepOutcome::Success { summary } => {
                task.transition(TaskStatus::Completed, format!("Task succeeded: {summary}"))
                    .map_err(state_err)?;
                self.commit(task).await?;
            }

            StepOutcome::Failure { reason, recoverable } => {
                if recoverable {
                    task.current_step.execution_state = Some(reason.clone());
                    task.park_waiting(
                        Utc::now(),
                        format!("Step {step_index} failed (recoverable): {reason}"),
                    )
                    .map_err(state_err)?;
                } else {
                    task.transition(TaskStatus::Failed, format!("Task failed: {reason}"))
                        .map_err(state_err)?;
                }
                self.commit(task).await?;
            }
        }

        Ok(StepReport::Executed {
            status: task.status,
        })
    }

    /// Cancel a task. Waits for any in-flight step to finish, then discards
    /// unresolved pending messages (never sent) and clears the schedule.
    pub async fn cancel(&self, task_id: Uuid) -> Result<Task> {
        let _guard = self.locks.acquire(task_id).await;
        let mut task = self.load(task_id).await?;

        if task.is_terminal() {
            return Err(TaskError::Terminal {
                id: task_id,
                status: task.status.to_string(),
            }
            .into());
        }

        let discarded = task.pending_messages.len();
        task.pending_messages.clear();
        let line = if discarded > 0 {
            format!("Cancelled by user; {discarded} pending message(s) discarded")
        } else {
            "Cancelled by user".to_string()
        };
        task.transition(TaskStatus::Cancelled, line)
            .map_err(|reason| Error::Task(TaskError::State { id: task_id, reason }))?;

        self.commit(&task).await?;
        self.locks.release(task_id).await;
        info!(task_id = %task_id, "Task cancelled");
        Ok(task)
    }

    /// Record a user-supplied fact and unblock a task waiting for input.
    pub async fn provide_input(&self, task_id: Uuid, key: &str, value: &str) -> Result<Task> {
        let _guard = self.locks.acquire(task_id).await;
        let mut task = self.load(task_id).await?;

        if task.is_terminal() {
            return Err(TaskError::Terminal {
                id: task_id,
                status: task.status.to_string(),
            }
            .into());
        }

        task.context_memory
            .insert(key.to_string(), value.to_string());

        if task.status == TaskStatus::WaitingForInput {
            task.transition(
                TaskStatus::Waiting,
                format!("Input received: {key}; resuming"),
            )
            .map_err(|reason| Error::Task(TaskError::State { id: task_id, reason }))?;
            // Wake on the next tick rather than a full poll interval.
            task.next_check = Some(Utc::now());
        } else {
            task.log(format!("Noted: {key} = {value}"));
        }

        self.commit(&task).await?;
        Ok(task)
    }

    /// Toggle auto-send. Drafts already queued still require resolution.
    pub async fn set_auto_send(&self, task_id: Uuid, enabled: bool) -> Result<Task> {
        let _guard = self.locks.acquire(task_id).await;
        let mut task = self.load(task_id).await?;
        task.auto_send = enabled;
        task.log(format!(
            "Auto-send {}",
            if enabled { "enabled" } else { "disabled" }
        ));
        self.commit(&task).await?;
        Ok(task)
    }

    /// Change the poll cadence. A waiting task is rescheduled relative to
    /// "now", not to its previous schedule.
    pub async fn set_poll_frequency(
        &self,
        task_id: Uuid,
        frequency: PollFrequency,
    ) -> Result<Task> {
        frequency
            .validate()
            .map_err(TaskError::InvalidPollFrequency)?;

        let _guard = self.locks.acquire(task_id).await;
        let mut task = self.load(task_id).await?;
        task.poll_frequency = frequency;
        if task.status == TaskStatus::Waiting {
            task.next_check = task.effective_poll().next_check_from(Utc::now());
        }
        task.log("Poll frequency changed");
        self.commit(&task).await?;
        Ok(task)
    }

    /// Hide a task from list results. A still-running task is cancelled
    /// first; the record survives for audit.
    pub async fn hide(&self, task_id: Uuid) -> Result<Task> {
        {
            let _guard = self.locks.acquire(task_id).await;
            let task = self.load(task_id).await?;
            if task.is_terminal() {
                drop(_guard);
                return self.mark_hidden(task_id).await;
            }
        }
        self.cancel(task_id).await?;
        self.mark_hidden(task_id).await
    }

    async fn mark_hidden(&self, task_id: Uuid) -> Result<Task> {
        let _guard = self.locks.acquire(task_id).await;
        let mut task = self.load(task_id).await?;
        task.hidden = true;
        task.log("Task hidden");
        self.commit(&task).await?;
        Ok(task)
    }

    /// Park tasks found `active` at startup — they were interrupted by a
    /// process exit mid-step.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let open = self.store.list_open_tasks().await?;
        let mut recovered = 0;
        for task in open {
            if task.status != TaskStatus::Active {
                continue;
            }
            let _guard = self.locks.acquire(task.id).await;
            let mut task = match self.store.get_task(task.id).await? {
                Some(t) if t.status == TaskStatus::Active => t,
                _ => continue,
            };
            task.park_waiting(Utc::now(), "Recovered after restart; step will re-run")
                .map_err(|reason| Error::Task(TaskError::State { id: task.id, reason }))?;
            self.commit(&task).await?;
            recovered += 1;
        }
        if recovered > 0 {
            info!(count = recovered, "Recovered interrupted tasks");
        }
        Ok(recovered)
    }

    async fn load(&self, task_id: Uuid) -> Result<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| TaskError::NotFound { id: task_id }.into())
    }

    async fn commit(&self, task: &Task) -> Result<()> {
        self.store.upsert_task(task).await?;
        let _ = self.events.send(TaskEvent::TaskUpdated { task: task.clone() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::stub::{RecordingSender, ScriptedExecutor};
    use crate::providers::{DecompositionGoal, MessageDraft};
    use crate::store::LibSqlBackend;
    use std::collections::BTreeMap;

    fn decomposition(steps: Vec<&str>, continuous: bool) -> Decomposition {
        Decomposition {
            title: "Test task".into(),
            goal: if continuous {
                DecompositionGoal::Continuous {
                    monitoring_condition: "reply arrived".into(),
                    trigger_action: "create event".into(),
                }
            } else {
                DecompositionGoal::Discrete {
                    success_criterion: "done".into(),
                }
            },
            steps: steps.into_iter().map(String::from).collect(),
        }
    }

    async fn engine_with(
        executor: Arc<ScriptedExecutor>,
        sender: Arc<RecordingSender>,
    ) -> (ExecutionEngine, Arc<dyn Database>) {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let (events, _) = broadcast::channel(64);
        let engine = ExecutionEngine::new(
            Arc::clone(&store),
            executor,
            sender,
            TaskLocks::new(),
            events,
        );
        (engine, store)
    }

    #[tokio::test]
    async fn advance_moves_to_next_step_and_parks() {
        let executor = Arc::new(ScriptedExecutor::with_outcomes(vec![StepOutcome::Advance {
            summary: "emailed Jeff".into(),
            memory: BTreeMap::from([("jeff_email".to_string(), "jeff@x.com".to_string())]),
        }]));
        let (engine, store) =
            engine_with(Arc::clone(&executor), Arc::new(RecordingSender::new())).await;

        let task = engine
            .create_task(
                decomposition(vec!["email Jeff", "wait for reply"], false),
                "dinner with Jeff",
                PollFrequency::preset_5m(),
                false,
            )
            .await
            .unwrap();

        let report = engine.step(task.id).await.unwrap();
        assert_eq!(
            report,
            StepReport::Executed {
                status: TaskStatus::Waiting
            }
        );

        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.current_step.index, 2);
        assert_eq!(stored.context_memory.get("jeff_email").unwrap(), "jeff@x.com");
        assert!(stored.next_check.is_some());
    }

    #[tokio::test]
    async fn final_step_advance_completes_discrete_task() {
        let executor = Arc::new(ScriptedExecutor::with_outcomes(vec![StepOutcome::Advance {
            summary: "note sent".into(),
            memory: BTreeMap::new(),
        }]));
        let (engine, store) =
            engine_with(executor, Arc::new(RecordingSender::new())).await;

        let task = engine
            .create_task(
                decomposition(vec!["only step"], false),
                "one-shot",
                PollFrequency::preset_5m(),
                false,
            )
            .await
            .unwrap();

        engine.step(task.id).await.unwrap();
        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.next_check.is_none());
    }

    #[tokio::test]
    async fn request_approval_parks_without_advancing() {
        let executor = Arc::new(ScriptedExecutor::with_outcomes(vec![
            StepOutcome::RequestApproval {
                draft: MessageDraft {
                    tool_name: "send_email".into(),
                    platform: "email".into(),
                    recipient: "jeff@x.com".into(),
                    subject: None,
                    body: "dinner?".into(),
                },
                memory: BTreeMap::from([("resolved".to_string(), "yes".to_string())]),
            },
        ]));
        let (engine, store) =
            engine_with(executor, Arc::new(RecordingSender::new())).await;

        let task = engine
            .create_task(
                decomposition(vec!["email Jeff", "wait"], false),
                "dinner",
                PollFrequency::preset_5m(),
                false,
            )
            .await
            .unwrap();

        engine.step(task.id).await.unwrap();
        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::WaitingApproval);
        assert_eq!(stored.pending_messages.len(), 1);
        // P2: the index does not advance past an unresolved approval.
        assert_eq!(stored.current_step.index, 1);
        // Memory delta landed before the gate was consulted.
        assert_eq!(stored.context_memory.get("resolved").unwrap(), "yes");
    }

    #[tokio::test]
    async fn auto_send_bypasses_gate() {
        let executor = Arc::new(ScriptedExecutor::with_outcomes(vec![
            StepOutcome::RequestApproval {
                draft: MessageDraft {
                    tool_name: "send_email".into(),
                    platform: "email".into(),
                    recipient: "jeff@x.com".into(),
                    subject: None,
                    body: "dinner?".into(),
                },
                memory: BTreeMap::new(),
            },
        ]));
        let sender = Arc::new(RecordingSender::new());
        let (engine, store) = engine_with(executor, Arc::clone(&sender)).await;

        let task = engine
            .create_task(
                decomposition(vec!["email Jeff", "wait"], false),
                "dinner",
                PollFrequency::preset_5m(),
                true,
            )
            .await
            .unwrap();

        engine.step(task.id).await.unwrap();
        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Waiting);
        assert!(stored.pending_messages.is_empty());
        assert_eq!(stored.current_step.index, 2);
        assert_eq!(sender.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn request_input_blocks_until_supplied() {
        let executor = Arc::new(ScriptedExecutor::with_outcomes(vec![
            StepOutcome::RequestInput {
                description: "contractor's phone number".into(),
            },
        ]));
        let (engine, store) =
            engine_with(executor, Arc::new(RecordingSender::new())).await;

        let task = engine
            .create_task(
                decomposition(vec!["call contractor"], false),
                "call Igor",
                PollFrequency::preset_5m(),
                false,
            )
            .await
            .unwrap();

        engine.step(task.id).await.unwrap();
        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::WaitingForInput);
        assert!(stored.next_check.is_none());

        let updated = engine
            .provide_input(task.id, "contractor_phone", "555-0134")
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Waiting);
        assert!(updated.next_check.unwrap() <= Utc::now());
        assert_eq!(
            updated.context_memory.get("contractor_phone").unwrap(),
            "555-0134"
        );
    }

    #[tokio::test]
    async fn recoverable_failure_keeps_cadence_and_index() {
        let executor = Arc::new(ScriptedExecutor::with_outcomes(vec![StepOutcome::Failure {
            reason: "inbox unreachable".into(),
            recoverable: true,
        }]));
        let (engine, store) =
            engine_with(executor, Arc::new(RecordingSender::new())).await;

        let task = engine
            .create_task(
                decomposition(vec!["check inbox", "reply"], false),
                "watch inbox",
                PollFrequency::preset_5m(),
                false,
            )
            .await
            .unwrap();

        engine.step(task.id).await.unwrap();
        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Waiting);
        assert_eq!(stored.current_step.index, 1);
        assert!(stored.next_check.is_some());
    }

    #[tokio::test]
    async fn terminal_failure_fails_task() {
        let executor = Arc::new(ScriptedExecutor::with_outcomes(vec![StepOutcome::Failure {
            reason: "goal unreachable".into(),
            recoverable: false,
        }]));
        let (engine, store) =
            engine_with(executor, Arc::new(RecordingSender::new())).await;

        let task = engine
            .create_task(
                decomposition(vec!["do thing"], false),
                "thing",
                PollFrequency::preset_5m(),
                false,
            )
            .await
            .unwrap();

        engine.step(task.id).await.unwrap();
        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.next_check.is_none());
    }

    #[tokio::test]
    async fn continuous_task_cycles_not_completes() {
        let executor = Arc::new(ScriptedExecutor::new());
        let (engine, store) =
            engine_with(executor, Arc::new(RecordingSender::new())).await;

        let task = engine
            .create_task(
                decomposition(vec!["check prices"], true),
                "watch flights",
                PollFrequency::preset_5m(),
                false,
            )
            .await
            .unwrap();

        for _ in 0..5 {
            // Simulate the scheduler firing at next_check.
            engine.step(task.id).await.unwrap();
            let stored = store.get_task(task.id).await.unwrap().unwrap();
            assert_eq!(stored.status, TaskStatus::Waiting);
            assert_eq!(stored.current_step.index, 1);
        }
    }

    #[tokio::test]
    async fn continuous_task_completes_on_success_outcome() {
        let executor = Arc::new(ScriptedExecutor::with_outcomes(vec![StepOutcome::Success {
            summary: "price dropped; notified".into(),
        }]));
        let (engine, store) =
            engine_with(executor, Arc::new(RecordingSender::new())).await;

        let task = engine
            .create_task(
                decomposition(vec!["check prices"], true),
                "watch flights",
                PollFrequency::preset_5m(),
                false,
            )
            .await
            .unwrap();

        engine.step(task.id).await.unwrap();
        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn step_on_non_runnable_status_is_noop() {
        let executor = Arc::new(ScriptedExecutor::with_outcomes(vec![
            StepOutcome::RequestApproval {
                draft: MessageDraft {
                    tool_name: "send_email".into(),
                    platform: "email".into(),
                    recipient: "x@y.z".into(),
                    subject: None,
                    body: "hi".into(),
                },
                memory: BTreeMap::new(),
            },
        ]));
        let (engine, store) =
            engine_with(Arc::clone(&executor), Arc::new(RecordingSender::new())).await;

        let task = engine
            .create_task(
                decomposition(vec!["email", "wait"], false),
                "x",
                PollFrequency::preset_5m(),
                false,
            )
            .await
            .unwrap();

        engine.step(task.id).await.unwrap();
        // Now waiting_approval — a second trigger must be a no-op.
        let report = engine.step(task.id).await.unwrap();
        assert_eq!(
            report,
            StepReport::Skipped {
                status: TaskStatus::WaitingApproval
            }
        );
        assert_eq!(executor.executed_steps().await.len(), 1);
        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.pending_messages.len(), 1);
    }

    #[tokio::test]
    async fn cancel_discards_pending_messages() {
        let executor = Arc::new(ScriptedExecutor::with_outcomes(vec![
            StepOutcome::RequestApproval {
                draft: MessageDraft {
                    tool_name: "send_email".into(),
                    platform: "email".into(),
                    recipient: "x@y.z".into(),
                    subject: None,
                    body: "hi".into(),
                },
                memory: BTreeMap::new(),
            },
        ]));
        let sender = Arc::new(RecordingSender::new());
        let (engine, store) = engine_with(executor, Arc::clone(&sender)).await;

        let task = engine
            .create_task(
                decomposition(vec!["email", "wait"], false),
                "x",
                PollFrequency::preset_5m(),
                false,
            )
            .await
            .unwrap();

        engine.step(task.id).await.unwrap();
        let cancelled = engine.cancel(task.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.pending_messages.is_empty());
        assert!(cancelled.next_check.is_none());
        assert!(sender.sent().await.is_empty());

        // Cancelling again is an error (already terminal).
        assert!(engine.cancel(task.id).await.is_err());
        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn status_and_log_commit_together() {
        let executor = Arc::new(ScriptedExecutor::new());
        let (engine, store) =
            engine_with(executor, Arc::new(RecordingSender::new())).await;

        let task = engine
            .create_task(
                decomposition(vec!["a", "b"], false),
                "x",
                PollFrequency::preset_5m(),
                false,
            )
            .await
            .unwrap();
        let log_len = task.execution_log.len();

        engine.step(task.id).await.unwrap();
        let stored = store.get_task(task.id).await.unwrap().unwrap();
        // Two transitions happened (pending->active, active->waiting), each
        // with exactly one log line.
        assert_eq!(stored.execution_log.len(), log_len + 2);
    }

    #[tokio::test]
    async fn hide_cancels_running_task_and_keeps_record() {
        let executor = Arc::new(ScriptedExecutor::new());
        let (engine, store) =
            engine_with(executor, Arc::new(RecordingSender::new())).await;

        let task = engine
            .create_task(
                decomposition(vec!["a"], false),
                "x",
                PollFrequency::preset_5m(),
                false,
            )
            .await
            .unwrap();

        let hidden = engine.hide(task.id).await.unwrap();
        assert!(hidden.hidden);
        assert_eq!(hidden.status, TaskStatus::Cancelled);
        assert!(store.get_task(task.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn poll_frequency_change_recomputes_from_now() {
        let executor = Arc::new(ScriptedExecutor::new());
        let (engine, _store) =
            engine_with(executor, Arc::new(RecordingSender::new())).await;

        let task = engine
            .create_task(
                decomposition(vec!["a", "b"], false),
                "x",
                PollFrequency::preset_5m(),
                false,
            )
            .await
            .unwrap();
        engine.step(task.id).await.unwrap();

        let before = Utc::now();
        let updated = engine
            .set_poll_frequency(task.id, PollFrequency::Custom { minutes: 60 })
            .await
            .unwrap();
        let next = updated.next_check.unwrap();
        let delta = next - before;
        assert!(delta.num_minutes() >= 59 && delta.num_minutes() <= 60);
    }

    #[tokio::test]
    async fn recover_interrupted_reparks_active_tasks() {
        let executor = Arc::new(ScriptedExecutor::new());
        let (engine, store) =
            engine_with(executor, Arc::new(RecordingSender::new())).await;

        let mut task = Task::from_decomposition(
            decomposition(vec!["a"], false),
            "x",
            PollFrequency::preset_5m(),
            false,
        )
        .unwrap();
        task.transition(TaskStatus::Active, "Step 1 started").unwrap();
        store.upsert_task(&task).await.unwrap();

        let recovered = engine.recover_interrupted().await.unwrap();
        assert_eq!(recovered, 1);
        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Waiting);
    }
}
