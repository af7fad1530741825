//! Pending-message gate — human approval for side-effecting drafts.
//!
//! A step that wants to send a message parks its task in `waiting_approval`
//! until the user approves (optionally editing the body) or rejects. Each
//! resolution is serialized per task and happens exactly once; the task never
//! sits in `waiting_approval` with an empty queue.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use super::locks::TaskLocks;
use super::model::{PendingMessage, Task, TaskEvent};
use super::state::TaskStatus;
use crate::error::{Error, GateError, Result, TaskError};
use crate::providers::{MessageDraft, MessageSender};
use crate::store::Database;

pub struct PendingMessageGate {
    store: Arc<dyn Database>,
    sender: Arc<dyn MessageSender>,
    locks: Arc<TaskLocks>,
    events: broadcast::Sender<TaskEvent>,
}

impl PendingMessageGate {
    pub fn new(
        store: Arc<dyn Database>,
        sender: Arc<dyn MessageSender>,
        locks: Arc<TaskLocks>,
        events: broadcast::Sender<TaskEvent>,
    ) -> Self {
        Self {
            store,
            sender,
            locks,
            events,
        }
    }

    /// Mutation half of `enqueue`: record the draft and park the task in
    /// `waiting_approval` without advancing the step index. Called by the
    /// execution engine inside its step commit, task lock already held.
    pub(crate) fn apply_enqueue(
        task: &mut Task,
        draft: MessageDraft,
    ) -> std::result::Result<PendingMessage, String> {
        let message = PendingMessage::from_draft(draft);
        task.pending_messages.push(message.clone());
        task.current_step.execution_state = Some(format!(
            "awaiting approval of {} to {}",
            message.tool_name, message.recipient
        ));
        if task.status != TaskStatus::WaitingApproval {
            task.transition(
                TaskStatus::WaitingApproval,
                format!(
                    "Awaiting approval: {} to {} via {}",
                    message.tool_name, message.recipient, message.platform
                ),
            )?;
        } else {
            task.log(format!(
                "Awaiting approval: {} to {} via {}",
                message.tool_name, message.recipient, message.platform
            ));
        }
        Ok(message)
    }

    /// Approve a pending message, optionally with an edited body, and send it.
    ///
    /// On send success the entry is removed; once the queue is empty the task
    /// either completes (the message belonged to the final step of a discrete
    /// plan) or advances past the step that produced it and returns to
    /// `waiting`. On send failure the entry is retained, the task stays in
    /// `waiting_approval`, and the error is surfaced so the caller can retry
    /// or edit-and-resend.
    pub async fn approve(
        &self,
        task_id: Uuid,
        message_id: Uuid,
        edited_body: Option<String>,
    ) -> Result<Task> {
        let _guard = self.locks.acquire(task_id).await;
        let mut task = self.load(task_id).await?;

        let pos = task
            .pending_messages
            .iter()
            .position(|m| m.id == message_id)
            .ok_or(GateError::MessageNotFound {
                task_id,
                id: message_id,
            })?;

        let mut message = task.pending_messages[pos].clone();
        if let Some(body) = edited_body {
            message.body = body;
        }

        let send_result = self
            .sender
            .send(
                &message.platform,
                &message.recipient,
                message.subject.as_deref(),
                &message.body,
            )
            .await;

        if let Err(e) = send_result {
            warn!(task_id = %task_id, message_id = %message_id, "Send failed: {e}");
            task.log(format!(
                "Send failed for message to {}: {e}",
                message.recipient
            ));
            self.commit(&task).await?;
            return Err(GateError::SendFailed {
                id: message_id,
                reason: e.to_string(),
            }
            .into());
        }

        task.pending_messages.remove(pos);
        info!(task_id = %task_id, message_id = %message_id, "Pending message approved and sent");

        if task.pending_messages.is_empty() {
            self.resolve_parked_status(&mut task, true, &message)
                .map_err(|reason| Error::Task(TaskError::State { id: task_id, reason }))?;
        } else {
            task.log(format!(
                "Approved and sent {} to {}",
                message.tool_name, message.recipient
            ));
        }

        self.commit(&task).await?;
        Ok(task)
    }

    /// Reject a pending message: discard it without sending.
    pub async fn reject(&self, task_id: Uuid, message_id: Uuid) -> Result<Task> {
        let _guard = self.locks.acquire(task_id).await;
        let mut task = self.load(task_id).await?;

        let pos = task
            .pending_messages
            .iter()
            .position(|m| m.id == message_id)
            .ok_or(GateError::MessageNotFound {
                task_id,
                id: message_id,
            })?;

        let message = task.pending_messages.remove(pos);
        info!(task_id = %task_id, message_id = %message_id, "Pending message rejected");

        if task.pending_messages.is_empty() {
            self.resolve_parked_status(&mut task, false, &message)
                .map_err(|reason| Error::Task(TaskError::State { id: task_id, reason }))?;
        } else {
            task.log(format!(
                "Rejected {} to {} (discarded, not sent)",
                message.tool_name, message.recipient
            ));
        }

        self.commit(&task).await?;
        Ok(task)
    }

    /// Recompute the task's status after the approval queue drained.
    ///
    /// Approval counts as completion of the step that produced the draft:
    /// the index advances (or a discrete task on its final step completes).
    /// Rejection leaves the index alone so the next run re-plans the step.
    fn resolve_parked_status(
        &self,
        task: &mut Task,
        sent: bool,
        message: &PendingMessage,
    ) -> std::result::Result<(), String> {
        if sent {
            if task.on_final_step() {
                return task.transition(
                    TaskStatus::Completed,
                    format!(
                        "Approved and sent {} to {}; final step complete",
                        message.tool_name, message.recipient
                    ),
                );
            }
            let from = task.current_step.index;
            task.advance_step();
            task.park_waiting(
                Utc::now(),
                format!(
                    "Approved and sent {} to {}; advanced to step {}/{}",
                    message.tool_name,
                    message.recipient,
                    task.current_step.index,
                    task.plan.len()
                ),
            )?;
            tracing::debug!(
                task_id = %task.id,
                from_step = from,
                to_step = task.current_step.index,
                "Step advanced on approval"
            );
            Ok(())
        } else {
            task.current_step.execution_state =
                Some(format!("{} to {} rejected", message.tool_name, message.recipient));
            task.park_waiting(
                Utc::now(),
                format!(
                    "Rejected {} to {} (discarded, not sent); step {} will re-run",
                    message.tool_name, message.recipient, task.current_step.index
                ),
            )
        }
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
