//! Task data model — the persisted unit of autonomous work.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::TaskStatus;
use crate::providers::{Decomposition, DecompositionGoal, MessageDraft};

/// Fixed poll cadence presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollPreset {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    Daily,
}

impl PollPreset {
    pub fn interval(&self) -> Duration {
        match self {
            Self::OneMinute => Duration::minutes(1),
            Self::FiveMinutes => Duration::minutes(5),
            Self::FifteenMinutes => Duration::minutes(15),
            Self::ThirtyMinutes => Duration::minutes(30),
            Self::OneHour => Duration::hours(1),
            Self::Daily => Duration::days(1),
        }
    }
}

/// Cadence policy governing how often a waiting task is re-checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PollFrequency {
    /// One of the fixed presets.
    Preset { value: PollPreset },
    /// Arbitrary fixed interval in minutes.
    Custom { minutes: u32 },
    /// Cron-expression cadence (seconds-resolution, 7-field).
    Cron { expr: String },
    /// Event-gated: fires at most once per process start, never on a timer.
    OnLogin,
}

impl PollFrequency {
    pub fn preset_5m() -> Self {
        Self::Preset {
            value: PollPreset::FiveMinutes,
        }
    }

    /// Compute the next wake-up time from `now`. `None` for event-gated
    /// cadences (the scheduler wakes those on its own terms) and for cron
    /// expressions with no future fire.
    pub fn next_check_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Preset { value } => Some(now + value.interval()),
            Self::Custom { minutes } => Some(now + Duration::minutes(i64::from(*minutes))),
            Self::Cron { expr } => cron::Schedule::from_str(expr)
                .ok()
                .and_then(|schedule| schedule.after(&now).next()),
            Self::OnLogin => None,
        }
    }

    /// Validate the frequency up front so bad cron strings are rejected at
    /// set time, not at wake time.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Custom { minutes } if *minutes == 0 => {
                Err("custom interval must be at least one minute".to_string())
            }
            Self::Cron { expr } => cron::Schedule::from_str(expr)
                .map(|_| ())
                .map_err(|e| format!("invalid cron expression '{expr}': {e}")),
            _ => Ok(()),
        }
    }
}

/// What kind of task this is — a goal with an end, or an open-ended monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    Discrete {
        success_criterion: String,
    },
    Continuous {
        monitoring_condition: String,
        trigger_action: String,
    },
}

impl From<DecompositionGoal> for TaskKind {
    fn from(goal: DecompositionGoal) -> Self {
        match goal {
            DecompositionGoal::Discrete { success_criterion } => {
                Self::Discrete { success_criterion }
            }
            DecompositionGoal::Continuous {
                monitoring_condition,
                trigger_action,
            } => Self::Continuous {
                monitoring_condition,
                trigger_action,
            },
        }
    }
}

impl TaskKind {
    pub fn is_continuous(&self) -> bool {
        matches!(self, Self::Continuous { .. })
    }
}

/// Position within the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentStep {
    /// 1-based index into the plan.
    pub index: usize,
    /// Description of the step at `index`.
    pub description: String,
    /// Why the current step has not advanced yet (last recoverable error,
    /// outstanding approval or input request). Cleared on advance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<String>,
    /// Optional cadence override for this step only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_override: Option<PollFrequency>,
}

/// One line of the append-only execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// A side-effecting draft awaiting human approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMessage {
    pub id: Uuid,
    /// Capability that produced the draft.
    pub tool_name: String,
    pub platform: String,
    pub recipient: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
    pub created: DateTime<Utc>,
}

impl PendingMessage {
    pub fn from_draft(draft: MessageDraft) -> Self {
        Self {
            id: Uuid::new_v4(),
            tool_name: draft.tool_name,
            platform: draft.platform,
            recipient: draft.recipient,
            subject: draft.subject,
            body: draft.body,
            created: Utc::now(),
        }
    }
}

/// A persisted, autonomously-progressing multi-step job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub status: TaskStatus,
    /// The verbatim user utterance that spawned the task. Immutable.
    pub original_request: String,
    pub kind: TaskKind,
    /// Ordered step descriptions, fixed at creation time.
    pub plan: Vec<String>,
    pub current_step: CurrentStep,
    pub poll_frequency: PollFrequency,
    /// When true, side-effecting steps bypass the approval gate.
    pub auto_send: bool,
    pub execution_log: Vec<LogEntry>,
    /// Facts accumulated during execution. Written only by the engine.
    pub context_memory: BTreeMap<String, String>,
    /// Next scheduled wake-up. `None` unless waiting on a timed cadence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_check: Option<DateTime<Utc>>,
    pub pending_messages: Vec<PendingMessage>,
    /// Hidden tasks stay in storage for audit but drop out of list results.
    #[serde(default)]
    pub hidden: bool,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Task {
    /// Create a task from a decomposition. Starts pending, at step 1, with
    /// empty memory and no pending messages.
    pub fn from_decomposition(
        decomposition: Decomposition,
        original_request: impl Into<String>,
        poll_frequency: PollFrequency,
        auto_send: bool,
    ) -> Result<Self, String> {
        if decomposition.steps.is_empty() {
            return Err("decomposition has no steps".to_string());
        }
        poll_frequency.validate()?;

        let now = Utc::now();
        let first_step = decomposition.steps[0].clone();
        let mut task = Self {
            id: Uuid::new_v4(),
            title: decomposition.title,
            status: TaskStatus::Pending,
            original_request: original_request.into(),
            kind: decomposition.goal.into(),
            plan: decomposition.steps,
            current_step: CurrentStep {
                index: 1,
                description: first_step,
                execution_state: None,
                poll_override: None,
            },
            poll_frequency,
            auto_send,
            execution_log: Vec::new(),
            context_memory: BTreeMap::new(),
            next_check: None,
            pending_messages: Vec::new(),
            hidden: false,
            created: now,
            last_updated: now,
        };
        task.log(format!("Task created: {}", task.title));
        Ok(task)
    }

    /// Append a log line and bump `last_updated`.
    pub fn log(&mut self, message: impl Into<String>) {
        self.execution_log.push(LogEntry {
            timestamp: Utc::now(),
            message: message.into(),
        });
        self.last_updated = Utc::now();
    }

    /// Transition to a new status, appending exactly one log line in the
    /// same mutation. Clears `next_check` whenever the task leaves `waiting`.
    pub fn transition(
        &mut self,
        target: TaskStatus,
        log_message: impl Into<String>,
    ) -> Result<(), String> {
        if !self.status.can_transition_to(target) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status, target
            ));
        }
        self.status = target;
        if target != TaskStatus::Waiting {
            self.next_check = None;
        }
        self.log(log_message);
        Ok(())
    }

    /// The cadence in effect: the current step's override if set, else the
    /// task-level frequency.
    pub fn effective_poll(&self) -> &PollFrequency {
        self.current_step
            .poll_override
            .as_ref()
            .unwrap_or(&self.poll_frequency)
    }

    /// Move to `waiting` and compute `next_check` from "now".
    pub fn park_waiting(
        &mut self,
        now: DateTime<Utc>,
        log_message: impl Into<String>,
    ) -> Result<(), String> {
        self.transition(TaskStatus::Waiting, log_message)?;
        self.next_check = self.effective_poll().next_check_from(now);
        Ok(())
    }

    /// Advance the step index. Discrete tasks return `false` when the plan is
    /// exhausted; continuous tasks wrap back to step 1 and always return
    /// `true`.
    pub fn advance_step(&mut self) -> bool {
        if self.current_step.index < self.plan.len() {
            self.current_step.index += 1;
        } else if self.kind.is_continuous() {
            self.current_step.index = 1;
        } else {
            return false;
        }
        self.current_step.description = self.plan[self.current_step.index - 1].clone();
        self.current_step.execution_state = None;
        self.current_step.poll_override = None;
        true
    }

    /// Whether the current step is the last of a discrete plan.
    pub fn on_final_step(&self) -> bool {
        !self.kind.is_continuous() && self.current_step.index == self.plan.len()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The last `n` log lines, oldest first.
    pub fn log_tail(&self, n: usize) -> &[LogEntry] {
        let start = self.execution_log.len().saturating_sub(n);
        &self.execution_log[start..]
    }
}

/// Events fanned out to subscribers (UI clients, WebSocket bridge).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Full sync of visible tasks (sent to a WS client on connect).
    TasksSync { tasks: Vec<Task> },
    /// A task changed (status, log, messages, settings).
    TaskUpdated { task: Task },
    /// A new pending message awaits approval.
    PendingMessageAdded {
        task_id: Uuid,
        message: PendingMessage,
    },
}
