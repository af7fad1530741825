//! Workflow arbiter — per-conversation single-slot workflow register.
//!
//! At most one special chat workflow (task clarification, fact confirmation,
//! inline execution) is active per conversation. Fact-confirmation requests
//! arriving while another workflow holds the slot are not shown; their facts
//! are deferred onto the active workflow and handed back exactly once when
//! the slot is vacated.
//!
//! This state is conversation-scoped and ephemeral: it lives in memory and
//! is lost on restart, unlike task records.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::providers::Fact;

/// The mutually-exclusive chat workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// Asking the user follow-up questions before creating a task.
    ClarifyingForTask,
    /// Offering extracted facts for confirmation.
    ConfirmingFacts,
    /// Running a short multi-step request inline in the chat.
    InlineExecution,
}

impl std::fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ClarifyingForTask => "clarifying_for_task",
            Self::ConfirmingFacts => "confirming_facts",
            Self::InlineExecution => "inline_execution",
        };
        write!(f, "{s}")
    }
}

/// Context carried by an active workflow.
#[derive(Debug, Clone, Default)]
pub struct WorkflowContext {
    /// The utterance that opened the workflow.
    pub original_query: String,
    /// Outstanding clarification questions, if any.
    pub clarification_questions: Vec<String>,
    /// Facts captured while this workflow held the slot.
    pub deferred_facts: Vec<Fact>,
}

#[derive(Debug, Clone)]
struct Slot {
    kind: WorkflowKind,
    context: WorkflowContext,
}

/// Result of trying to occupy a conversation's workflow slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrySet {
    /// Slot was free; the workflow is now active.
    Accepted,
    /// Slot busy; the fact-confirmation's facts were deferred onto the
    /// active workflow instead.
    FactsDeferred,
    /// Slot busy and the incoming workflow cannot be deferred.
    Rejected { active: WorkflowKind },
}

/// Per-conversation workflow slots.
#[derive(Default)]
pub struct WorkflowArbiter {
    slots: Mutex<HashMap<String, Slot>>,
}

impl WorkflowArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to occupy the slot for a conversation.
    ///
    /// An incoming `ConfirmingFacts` request against an occupied slot defers
    /// its facts instead of interrupting; any other incoming kind is rejected
    /// outright.
    pub async fn try_set(
        &self,
        conversation: &str,
        kind: WorkflowKind,
        context: WorkflowContext,
    ) -> TrySet {
        let mut slots = self.slots.lock().await;
        if let Some(active) = slots.get_mut(conversation) {
            if kind == WorkflowKind::ConfirmingFacts {
                debug!(
                    conversation,
                    active = %active.kind,
                    count = context.deferred_facts.len(),
                    "Facts deferred behind active workflow"
                );
                active.context.deferred_facts.extend(context.deferred_facts);
                return TrySet::FactsDeferred;
            }
            return TrySet::Rejected {
                active: active.kind,
            };
        }

        debug!(conversation, workflow = %kind, "Workflow slot occupied");
        slots.insert(conversation.to_string(), Slot { kind, context });
        TrySet::Accepted
    }

    /// The kind of workflow currently holding the slot, if any.
    pub async fn active(&self, conversation: &str) -> Option<WorkflowKind> {
        self.slots.lock().await.get(conversation).map(|s| s.kind)
    }

    /// Snapshot of the active workflow's context.
    pub async fn context(&self, conversation: &str) -> Option<WorkflowContext> {
        self.slots
            .lock()
            .await
            .get(conversation)
            .map(|s| s.context.clone())
    }

    /// Append facts to the active workflow without taking the slot.
    pub async fn defer_facts(&self, conversation: &str, facts: Vec<Fact>) -> bool {
        let mut slots = self.slots.lock().await;
        match slots.get_mut(conversation) {
            Some(slot) => {
                slot.context.deferred_facts.extend(facts);
                true
            }
            None => false,
        }
    }

    /// Vacate the slot, handing back any deferred facts.
    ///
    /// The take is atomic: a concurrent second clear observes an empty list,
    /// never the same facts twice.
    pub async fn clear(&self, conversation: &str) -> Vec<Fact> {
        let mut slots = self.slots.lock().await;
        match slots.remove(conversation) {
            Some(slot) => {
                debug!(
                    conversation,
                    workflow = %slot.kind,
                    deferred = slot.context.deferred_facts.len(),
                    "Workflow slot vacated"
                );
                slot.context.deferred_facts
            }
            None => Vec::new(),
        }
    }
}
