//! Chat router — turns utterances into task creations, clarifications,
//! inline runs, or fact confirmations, under the arbiter's single-slot rule.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::arbiter::{TrySet, WorkflowArbiter, WorkflowContext, WorkflowKind};
use crate::error::Result;
use crate::providers::{
    DecomposeOutcome, Decomposer, Fact, FactExtractor, StepExecutor, StepOutcome,
};
use crate::tasks::model::Task;
use crate::tasks::service::TaskService;
use crate::tasks::state::TaskStatus;

/// Recent user-authored messages kept per conversation.
const CONTEXT_WINDOW: usize = 20;

/// What the router decided to do with an utterance.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatReply {
    /// A background task was created. Any facts deferred during
    /// clarification ride along for confirmation.
    TaskCreated {
        task: Task,
        facts_to_confirm: Vec<Fact>,
    },
    /// The decomposer needs answers before a task can be created.
    Clarification { questions: Vec<String> },
    /// An inline run finished (or stopped early); transcript included.
    InlineResult {
        transcript: Vec<String>,
        facts_to_confirm: Vec<Fact>,
    },
    /// Facts were extracted and should be offered for confirmation.
    ConfirmFacts { facts: Vec<Fact> },
    /// The utterance answered a task that was waiting for input.
    InputRecorded { task_id: Uuid },
    /// A workflow is busy; captured facts (if any) were deferred.
    Busy { active: String },
    /// Nothing to do.
    NoAction,
}

pub struct ChatRouter {
    arbiter: Arc<WorkflowArbiter>,
    decomposer: Arc<dyn Decomposer>,
    extractor: Arc<dyn FactExtractor>,
    executor: Arc<dyn StepExecutor>,
    service: Arc<TaskService>,
    /// Recent user messages per conversation, newest last.
    history: Mutex<HashMap<String, Vec<String>>>,
}

impl ChatRouter {
    pub fn new(
        arbiter: Arc<WorkflowArbiter>,
        decomposer: Arc<dyn Decomposer>,
        extractor: Arc<dyn FactExtractor>,
        executor: Arc<dyn StepExecutor>,
        service: Arc<TaskService>,
    ) -> Self {
        Self {
            arbiter,
            decomposer,
            extractor,
            executor,
            service,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Route one user utterance.
    pub async fn handle_utterance(&self, conversation: &str, utterance: &str) -> Result<ChatReply> {
        self.remember(conversation, utterance).await;

        match self.arbiter.active(conversation).await {
            Some(WorkflowKind::ClarifyingForTask) => {
                self.handle_clarification_answer(conversation, utterance)
                    .await
            }
            Some(WorkflowKind::InlineExecution) => {
                // Suppress competing behavior; capture side information only.
                let facts = self.extractor.extract(utterance).await?;
                if !facts.is_empty() {
                    self.arbiter.defer_facts(conversation, facts).await;
                }
                Ok(ChatReply::Busy {
                    active: WorkflowKind::InlineExecution.to_string(),
                })
            }
            Some(WorkflowKind::ConfirmingFacts) => {
                // Moving on dismisses the offer; re-route the utterance fresh.
                debug!(conversation, "Fact confirmation superseded by new message");
                self.arbiter.clear(conversation).await;
                self.dispatch_fresh(conversation, utterance).await
            }
            None => self.dispatch_fresh(conversation, utterance).await,
        }
    }

    /// Resolve an active fact-confirmation workflow. Returns the deferred
    /// facts that should now be re-offered, if any.
    pub async fn resolve_fact_confirmation(&self, conversation: &str) -> Vec<Fact> {
        self.arbiter.clear(conversation).await
    }

    /// No workflow active: decompose, fall back to input routing and fact
    /// capture.
    async fn dispatch_fresh(&self, conversation: &str, utterance: &str) -> Result<ChatReply> {
        // A task blocked on input gets first claim on the utterance.
        if let Some(reply) = self.try_answer_waiting_task(utterance).await? {
            return Ok(reply);
        }

        let context = self.context_window(conversation).await;
        match self.decomposer.decompose(utterance, &context).await? {
            DecomposeOutcome::Task(decomposition) => {
                let task = self
                    .service
                    .create_task(decomposition, utterance, None, false)
                    .await?;
                info!(conversation, task_id = %task.id, "Task created from chat");
                Ok(ChatReply::TaskCreated {
                    task,
                    facts_to_confirm: Vec::new(),
                })
            }
            DecomposeOutcome::NeedsClarification { questions } => {
                let accepted = self
                    .arbiter
                    .try_set(
                        conversation,
                        WorkflowKind::ClarifyingForTask,
                        WorkflowContext {
                            original_query: utterance.to_string(),
                            clarification_questions: questions.clone(),
                            deferred_facts: Vec::new(),
                        },
                    )
                    .await;
                match accepted {
                    TrySet::Accepted => Ok(ChatReply::Clarification { questions }),
                    TrySet::Rejected { active } => Ok(ChatReply::Busy {
                        active: active.to_string(),
                    }),
                    TrySet::FactsDeferred => unreachable!("clarification never defers"),
                }
            }
            DecomposeOutcome::InlineRun { steps } => {
                let accepted = self
                    .arbiter
                    .try_set(
                        conversation,
                        WorkflowKind::InlineExecution,
                        WorkflowContext {
                            original_query: utterance.to_string(),
                            ..Default::default()
                        },
                    )
                    .await;
                if let TrySet::Rejected { active } = accepted {
                    return Ok(ChatReply::Busy {
                        active: active.to_string(),
                    });
                }
                let transcript = self.run_inline(utterance, steps).await;
                // Vacating the slot hands back anything deferred mid-run.
                let facts_to_confirm = self.arbiter.clear(conversation).await;
                Ok(ChatReply::InlineResult {
                    transcript,
                    facts_to_confirm,
                })
            }
            DecomposeOutcome::NotATask => self.capture_facts(conversation, utterance).await,
        }
    }

    /// The utterance answers outstanding clarification questions.
    async fn handle_clarification_answer(
        &self,
        conversation: &str,
        utterance: &str,
    ) -> Result<ChatReply> {
        let context = self.context_window(conversation).await;
        match self.decomposer.decompose(utterance, &context).await? {
            DecomposeOutcome::Task(decomposition) => {
                let task = self
                    .service
                    .create_task(decomposition, utterance, None, false)
                    .await?;
                info!(conversation, task_id = %task.id, "Task created after clarification");
                let facts_to_confirm = self.arbiter.clear(conversation).await;
                Ok(ChatReply::TaskCreated {
                    task,
                    facts_to_confirm,
                })
            }
            DecomposeOutcome::NeedsClarification { questions } => {
                // Still missing details; keep the slot, refresh the questions.
                Ok(ChatReply::Clarification { questions })
            }
            // A terminal answer: the user walked the request back.
            _ => {
                debug!(conversation, "Clarification resolved without a task");
                let deferred = self.arbiter.clear(conversation).await;
                if deferred.is_empty() {
                    Ok(ChatReply::NoAction)
                } else {
                    Ok(ChatReply::ConfirmFacts { facts: deferred })
                }
            }
        }
    }

    /// Feed extracted facts into the oldest task blocked on input.
    async fn try_answer_waiting_task(&self, utterance: &str) -> Result<Option<ChatReply>> {
        let waiting: Vec<Task> = self
            .service
            .list_tasks()
            .await?
            .into_iter()
            .filter(|t| t.status == TaskStatus::WaitingForInput)
            .collect();
        if waiting.is_empty() {
            return Ok(None);
        }

        let facts = self.extractor.extract(utterance).await?;
        if facts.is_empty() {
            return Ok(None);
        }

        let Some(target) = waiting.iter().min_by_key(|t| t.last_updated) else {
            return Ok(None);
        };
        for fact in &facts {
            self.service
                .provide_input(target.id, &fact.key, &fact.value)
                .await?;
        }
        Ok(Some(ChatReply::InputRecorded { task_id: target.id }))
    }

    /// No task shape found: offer extracted facts for confirmation.
    async fn capture_facts(&self, conversation: &str, utterance: &str) -> Result<ChatReply> {
        let facts = self.extractor.extract(utterance).await?;
        if facts.is_empty() {
            return Ok(ChatReply::NoAction);
        }

        let accepted = self
            .arbiter
            .try_set(
                conversation,
                WorkflowKind::ConfirmingFacts,
                WorkflowContext {
                    original_query: utterance.to_string(),
                    clarification_questions: Vec::new(),
                    deferred_facts: facts.clone(),
                },
            )
            .await;
        match accepted {
            TrySet::Accepted => Ok(ChatReply::ConfirmFacts { facts }),
            TrySet::FactsDeferred => Ok(ChatReply::Busy {
                active: "deferred".to_string(),
            }),
            TrySet::Rejected { active } => Ok(ChatReply::Busy {
                active: active.to_string(),
            }),
        }
    }

    /// Run inline steps sequentially. Stops on the first outcome an inline
    /// run cannot handle (approvals and input requests need a real task).
    async fn run_inline(&self, utterance: &str, steps: Vec<String>) -> Vec<String> {
        let mut transcript = Vec::new();
        let memory = BTreeMap::new();
        for (i, step) in steps.iter().enumerate() {
            let n = i + 1;
            match self.executor.execute(step, &memory, utterance).await {
                Ok(StepOutcome::Advance { summary, .. }) => {
                    transcript.push(format!("Step {n}: {summary}"));
                }
                Ok(StepOutcome::Success { summary }) => {
                    transcript.push(format!("Step {n}: {summary}"));
                    break;
                }
                Ok(StepOutcome::RequestApproval { draft, .. }) => {
                    transcript.push(format!(
                        "Step {n}: wants to send a message to {}; create a task to approve and send it",
                        draft.recipient
                    ));
                    break;
                }
                Ok(StepOutcome::RequestInput { description }) => {
                    transcript.push(format!("Step {n}: needs more information: {description}"));
                    break;
                }
                Ok(StepOutcome::Failure { reason, .. }) => {
                    transcript.push(format!("Step {n} failed: {reason}"));
                    break;
                }
                Err(e) => {
                    transcript.push(format!("Step {n} errored: {e}"));
                    break;
                }
            }
        }
        transcript
    }

    async fn remember(&self, conversation: &str, utterance: &str) {
        let mut history = self.history.lock().await;
        let messages = history.entry(conversation.to_string()).or_default();
        messages.push(utterance.to_string());
        while messages.len() > CONTEXT_WINDOW {
            messages.remove(0);
        }
    }

    async fn context_window(&self, conversation: &str) -> Vec<String> {
        self.history
            .lock()
            .await
            .get(conversation)
            .cloned()
            .unwrap_or_default()
    }
}
