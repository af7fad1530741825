//! Scripted collaborators for dev mode and deterministic tests.
//!
//! Each stub pops pre-configured results from a FIFO queue, falling back to a
//! harmless default when the queue runs dry. No network, no model calls.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    DecomposeOutcome, Decomposer, Fact, FactExtractor, MessageSender, StepExecutor, StepOutcome,
};
use crate::error::ProviderError;

/// Decomposer that replays scripted outcomes.
pub struct ScriptedDecomposer {
    outcomes: Arc<Mutex<VecDeque<DecomposeOutcome>>>,
}

impl ScriptedDecomposer {
    pub fn new() -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn with_outcomes(outcomes: Vec<DecomposeOutcome>) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(VecDeque::from(outcomes))),
        }
    }

    pub async fn push(&self, outcome: DecomposeOutcome) {
        self.outcomes.lock().await.push_back(outcome);
    }
}

impl Default for ScriptedDecomposer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Decomposer for ScriptedDecomposer {
    async fn decompose(
        &self,
        _utterance: &str,
        _conversation_context: &[String],
    ) -> Result<DecomposeOutcome, ProviderError> {
        Ok(self
            .outcomes
            .lock()
            .await
            .pop_front()
            .unwrap_or(DecomposeOutcome::NotATask))
    }
}

/// Fact extractor that replays scripted fact batches.
pub struct ScriptedExtractor {
    batches: Arc<Mutex<VecDeque<Vec<Fact>>>>,
}

impl ScriptedExtractor {
    pub fn new() -> Self {
        Self {
            batches: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn with_batches(batches: Vec<Vec<Fact>>) -> Self {
        Self {
            batches: Arc::new(Mutex::new(VecDeque::from(batches))),
        }
    }

    pub async fn push(&self, facts: Vec<Fact>) {
        self.batches.lock().await.push_back(facts);
    }
}

impl Default for ScriptedExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FactExtractor for ScriptedExtractor {
    async fn extract(&self, _utterance: &str) -> Result<Vec<Fact>, ProviderError> {
        Ok(self.batches.lock().await.pop_front().unwrap_or_default())
    }
}

/// Step executor that replays scripted step outcomes.
///
/// When the queue is empty it returns a generic `Advance`, which keeps
/// dev-mode tasks marching through their plans.
pub struct ScriptedExecutor {
    outcomes: Arc<Mutex<VecDeque<StepOutcome>>>,
    /// Steps actually executed, for assertions.
    executed: Arc<Mutex<Vec<String>>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(VecDeque::new())),
            executed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_outcomes(outcomes: Vec<StepOutcome>) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(VecDeque::from(outcomes))),
            executed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn push(&self, outcome: StepOutcome) {
        self.outcomes.lock().await.push_back(outcome);
    }

    /// Descriptions of every step this executor has run, in order.
    pub async fn executed_steps(&self) -> Vec<String> {
        self.executed.lock().await.clone()
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        step_description: &str,
        _context_memory: &BTreeMap<String, String>,
        _original_request: &str,
    ) -> Result<StepOutcome, ProviderError> {
        self.executed
            .lock()
            .await
            .push(step_description.to_string());
        Ok(self
            .outcomes
            .lock()
            .await
            .pop_front()
            .unwrap_or(StepOutcome::Advance {
                summary: format!("Completed: {step_description}"),
                memory: BTreeMap::new(),
            }))
    }
}

/// A sent message captured by [`RecordingSender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub platform: String,
    pub recipient: String,
    pub subject: Option<String>,
    pub body: String,
}

/// Message sender that records sends instead of delivering them.
///
/// Can be told to fail the next N sends to exercise the retained-on-failure
/// path of the approval gate.
pub struct RecordingSender {
    sent: Arc<Mutex<Vec<SentMessage>>>,
    fail_next: Arc<Mutex<u32>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            fail_next: Arc::new(Mutex::new(0)),
        }
    }

    /// Make the next `n` sends fail.
    pub async fn fail_next(&self, n: u32) {
        *self.fail_next.lock().await = n;
    }

    pub async fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().await.clone()
    }
}

impl Default for RecordingSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(
        &self,
        platform: &str,
        recipient: &str,
        subject: Option<&str>,
        body: &str,
    ) -> Result<(), ProviderError> {
        {
            let mut fail = self.fail_next.lock().await;
            if *fail > 0 {
                *fail -= 1;
                return Err(ProviderError::Send {
                    platform: platform.to_string(),
                    recipient: recipient.to_string(),
                    reason: "scripted failure".to_string(),
                });
            }
        }
        self.sent.lock().await.push(SentMessage {
            platform: platform.to_string(),
            recipient: recipient.to_string(),
            subject: subject.map(str::to_string),
            body: body.to_string(),
        });
        Ok(())
    }
}
