//! Task status state machine.

use serde::{Deserialize, Serialize};

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet picked up by the scheduler.
    Pending,
    /// Currently executing a step. Doubles as the per-task execution lock.
    Active,
    /// Idle, scheduled for a future check.
    Waiting,
    /// Blocked on one or more pending messages awaiting approval.
    WaitingApproval,
    /// Blocked on information only the user can supply.
    WaitingForInput,
    /// Success criterion met or final plan step finished.
    Completed,
    /// Step executor reported a non-recoverable error.
    Failed,
    /// Explicitly cancelled by the user.
    Cancelled,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        // Any non-terminal task can be cancelled.
        if target == Cancelled && !self.is_terminal() {
            return true;
        }

        matches!(
            (self, target),
            // First scheduler tick or manual run-now
            (Pending, Active) |
            // Step outcomes
            (Active, Waiting) | (Active, WaitingApproval) |
            (Active, WaitingForInput) | (Active, Completed) | (Active, Failed) |
            // Scheduler fires at next_check
            (Waiting, Active) |
            // All pending messages resolved
            (WaitingApproval, Active) | (WaitingApproval, Waiting) |
            // Approving the final step's message completes the task
            (WaitingApproval, Completed) |
            // User supplied the missing fact
            (WaitingForInput, Active) | (WaitingForInput, Waiting)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Statuses that require explicit user attention beyond routine monitoring.
    pub fn needs_attention(&self) -> bool {
        matches!(self, Self::Failed | Self::WaitingForInput)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Waiting => "waiting",
            Self::WaitingApproval => "waiting_approval",
            Self::WaitingForInput => "waiting_for_input",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "waiting" => Ok(Self::Waiting),
            "waiting_approval" => Ok(Self::WaitingApproval),
            "waiting_for_input" => Ok(Self::WaitingForInput),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown task status: {s}")),
        }
    }
}
