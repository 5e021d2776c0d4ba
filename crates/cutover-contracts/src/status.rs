// Status enums shared by storage rows, engine state machines, and API DTOs
//
// Rows persist statuses as text; these enums are the single vocabulary and
// every transition in the engine goes through compare-and-set updates keyed
// on them.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Lifecycle of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Detected,
    InitDispatched,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    /// Completed and failed batches are never touched again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }

    /// Live batches are scheduled and may receive members; cancelled batches
    /// are excluded even though they are not terminal.
    pub fn is_live(&self) -> bool {
        !self.is_terminal() && *self != BatchStatus::Cancelled
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchStatus::Detected => write!(f, "detected"),
            BatchStatus::InitDispatched => write!(f, "init_dispatched"),
            BatchStatus::Active => write!(f, "active"),
            BatchStatus::Completed => write!(f, "completed"),
            BatchStatus::Failed => write!(f, "failed"),
            BatchStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detected" => Ok(BatchStatus::Detected),
            "init_dispatched" => Ok(BatchStatus::InitDispatched),
            "active" => Ok(BatchStatus::Active),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            "cancelled" => Ok(BatchStatus::Cancelled),
            _ => Err(format!("Unknown batch status: {}", s)),
        }
    }
}

/// Membership of an entity in a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Active,
    Removed,
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberStatus::Active => write!(f, "active"),
            MemberStatus::Removed => write!(f, "removed"),
        }
    }
}

impl std::str::FromStr for MemberStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(MemberStatus::Active),
            "removed" => Ok(MemberStatus::Removed),
            _ => Err(format!("Unknown member status: {}", s)),
        }
    }
}

/// Lifecycle of a phase execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Dispatched,
    Completed,
    Failed,
    Skipped,
    Superseded,
}

impl PhaseStatus {
    /// Statuses that count toward batch completion.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            PhaseStatus::Completed | PhaseStatus::Skipped | PhaseStatus::Superseded
        )
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseStatus::Pending => write!(f, "pending"),
            PhaseStatus::Dispatched => write!(f, "dispatched"),
            PhaseStatus::Completed => write!(f, "completed"),
            PhaseStatus::Failed => write!(f, "failed"),
            PhaseStatus::Skipped => write!(f, "skipped"),
            PhaseStatus::Superseded => write!(f, "superseded"),
        }
    }
}

impl std::str::FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PhaseStatus::Pending),
            "dispatched" => Ok(PhaseStatus::Dispatched),
            "completed" => Ok(PhaseStatus::Completed),
            "failed" => Ok(PhaseStatus::Failed),
            "skipped" => Ok(PhaseStatus::Skipped),
            "superseded" => Ok(PhaseStatus::Superseded),
            _ => Err(format!("Unknown phase status: {}", s)),
        }
    }
}

/// Lifecycle of a step or init execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Dispatched,
    Polling,
    Succeeded,
    Failed,
    PollTimeout,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded
                | StepStatus::Failed
                | StepStatus::PollTimeout
                | StepStatus::Cancelled
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Dispatched => write!(f, "dispatched"),
            StepStatus::Polling => write!(f, "polling"),
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::PollTimeout => write!(f, "poll_timeout"),
            StepStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "dispatched" => Ok(StepStatus::Dispatched),
            "polling" => Ok(StepStatus::Polling),
            "succeeded" => Ok(StepStatus::Succeeded),
            "failed" => Ok(StepStatus::Failed),
            "poll_timeout" => Ok(StepStatus::PollTimeout),
            "cancelled" => Ok(StepStatus::Cancelled),
            _ => Err(format!("Unknown step status: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_liveness() {
        assert!(BatchStatus::Detected.is_live());
        assert!(BatchStatus::Active.is_live());
        assert!(!BatchStatus::Completed.is_live());
        assert!(!BatchStatus::Failed.is_live());
        assert!(!BatchStatus::Cancelled.is_live());
        assert!(!BatchStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_round_trips() {
        for status in [
            BatchStatus::Detected,
            BatchStatus::InitDispatched,
            BatchStatus::Active,
            BatchStatus::Completed,
            BatchStatus::Failed,
            BatchStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<BatchStatus>().unwrap(), status);
        }
        for status in [
            StepStatus::Pending,
            StepStatus::Dispatched,
            StepStatus::Polling,
            StepStatus::Succeeded,
            StepStatus::Failed,
            StepStatus::PollTimeout,
            StepStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<StepStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_settled_phases() {
        assert!(PhaseStatus::Completed.is_settled());
        assert!(PhaseStatus::Skipped.is_settled());
        assert!(PhaseStatus::Superseded.is_settled());
        assert!(!PhaseStatus::Failed.is_settled());
        assert!(!PhaseStatus::Dispatched.is_settled());
    }
}
