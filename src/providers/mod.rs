//! External collaborator interfaces.
//!
//! The engine never calls a language model or a messaging platform directly.
//! Everything side-effecting or model-driven comes in through the four traits
//! here, so the core stays testable with scripted implementations.

pub mod stub;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// What a request decomposes into: a persistent task plan, an inline run,
/// a request for clarification, or nothing task-shaped at all.
#[derive(Debug, Clone)]
pub enum DecomposeOutcome {
    /// A structured plan worth persisting as a background task.
    Task(Decomposition),
    /// A short multi-step run to execute inline in the chat, no persistence.
    InlineRun { steps: Vec<String> },
    /// The request is a task but details are missing.
    NeedsClarification { questions: Vec<String> },
    /// Not a task; the utterance may still carry facts.
    NotATask,
}

/// A structured plan produced by the decomposer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decomposition {
    /// Human label for the task.
    pub title: String,
    /// Discrete goal or continuous monitor.
    pub goal: DecompositionGoal,
    /// Ordered step descriptions. Fixed once the task is created.
    pub steps: Vec<String>,
}

/// Goal shape of a decomposition. Discrete tasks end when their success
/// criterion is met; continuous tasks watch a condition and fire an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecompositionGoal {
    Discrete {
        success_criterion: String,
    },
    Continuous {
        monitoring_condition: String,
        trigger_action: String,
    },
}

/// An informational fact extracted from chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub key: String,
    pub value: String,
    /// Set when the extractor noticed a conflict with a previously known value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicts_with: Option<String>,
}

impl Fact {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            conflicts_with: None,
        }
    }
}

/// A side-effecting message draft produced by a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDraft {
    /// Capability that produced the draft (e.g. "send_email").
    pub tool_name: String,
    /// Delivery platform (e.g. "email", "telegram").
    pub platform: String,
    pub recipient: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
}

/// Structured result of executing one plan step.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Step done; move on. May carry new facts for the task's context memory.
    Advance {
        summary: String,
        memory: BTreeMap<String, String>,
    },
    /// Step wants to send a message; park it for human approval.
    RequestApproval {
        draft: MessageDraft,
        memory: BTreeMap<String, String>,
    },
    /// Step is blocked on information only the user can supply.
    RequestInput { description: String },
    /// Task-level success: criterion met (discrete) or trigger fired
    /// and acted on (continuous).
    Success { summary: String },
    /// Step failed. Recoverable failures keep the task polling; terminal
    /// ones fail it.
    Failure { reason: String, recoverable: bool },
}

/// Decomposes a natural-language request into a step plan.
#[async_trait]
pub trait Decomposer: Send + Sync {
    async fn decompose(
        &self,
        utterance: &str,
        conversation_context: &[String],
    ) -> Result<DecomposeOutcome, ProviderError>;
}

/// Extracts informational facts from an utterance.
#[async_trait]
pub trait FactExtractor: Send + Sync {
    async fn extract(&self, utterance: &str) -> Result<Vec<Fact>, ProviderError>;
}

/// Executes one plan step against the outside world.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        step_description: &str,
        context_memory: &BTreeMap<String, String>,
        original_request: &str,
    ) -> Result<StepOutcome, ProviderError>;
}

/// Delivers an approved (or auto-send) message.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(
        &self,
        platform: &str,
        recipient: &str,
        subject: Option<&str>,
        body: &str,
    ) -> Result<(), ProviderError>;
}
