//! Execution, stage and step domain types
//!
//! An execution is one run of a pipeline. It owns an ordered set of stages,
//! each of which owns an ordered set of steps. All three carry their own
//! status; the orchestrator derives stage and execution outcomes from their
//! children.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::domain::event::EventPosition;

/// What caused an execution to be created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCause {
    Push,
    Tag,
    PullRequest,
    Manual,
    Cron,
}

impl fmt::Display for TriggerCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerCause::Push => "push",
            TriggerCause::Tag => "tag",
            TriggerCause::PullRequest => "pull_request",
            TriggerCause::Manual => "manual",
            TriggerCause::Cron => "cron",
        };
        f.write_str(s)
    }
}

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failure,
    Error,
    Canceled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failure => "failure",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => ExecutionStatus::Pending,
            "running" => ExecutionStatus::Running,
            "success" => ExecutionStatus::Success,
            "failure" => ExecutionStatus::Failure,
            "error" => ExecutionStatus::Error,
            "canceled" => ExecutionStatus::Canceled,
            _ => return None,
        })
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage status
///
/// `Waiting` stages still have unfinished dependencies; `Pending` stages are
/// schedulable and may be claimed by a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Waiting,
    Pending,
    Running,
    Success,
    Failure,
    Error,
    Skipped,
    Canceled,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            StageStatus::Waiting | StageStatus::Pending | StageStatus::Running
        )
    }

    /// Terminal states that unblock dependents
    pub fn is_success(self) -> bool {
        self == StageStatus::Success
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Waiting => "waiting",
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Success => "success",
            StageStatus::Failure => "failure",
            StageStatus::Error => "error",
            StageStatus::Skipped => "skipped",
            StageStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "waiting" => StageStatus::Waiting,
            "pending" => StageStatus::Pending,
            "running" => StageStatus::Running,
            "success" => StageStatus::Success,
            "failure" => StageStatus::Failure,
            "error" => StageStatus::Error,
            "skipped" => StageStatus::Skipped,
            "canceled" => StageStatus::Canceled,
            _ => return None,
        })
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failure,
    Error,
    Skipped,
    Canceled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failure => "failure",
            StepStatus::Error => "error",
            StepStatus::Skipped => "skipped",
            StepStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => StepStatus::Pending,
            "running" => StepStatus::Running,
            "success" => StepStatus::Success,
            "failure" => StepStatus::Failure,
            "error" => StepStatus::Error,
            "skipped" => StepStatus::Skipped,
            "canceled" => StepStatus::Canceled,
            _ => return None,
        })
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source and target references of an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRefs {
    /// Ref the change comes from (pushed branch, PR source branch)
    pub source_ref: String,
    /// Ref the change goes to (same as source for pushes)
    pub target_ref: String,
    /// Commit the execution builds
    pub commit_sha: String,
    /// Previous head for pushes, if known
    pub before_sha: Option<String>,
}

/// One run of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub repo_id: String,
    /// Sequence number, strictly increasing per pipeline
    pub number: i64,
    pub cause: TriggerCause,
    pub refs: ExecutionRefs,
    pub status: ExecutionStatus,
    /// Whether a failed stage skips the rest of the graph
    pub fail_fast: bool,
    pub params: HashMap<String, String>,
    /// Duplicate-suppression key, unique per pipeline when present
    pub idempotency_key: Option<String>,
    /// Bus position of the event that created this execution
    pub source_event: Option<EventPosition>,
    pub triggered_by: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Runner claim on a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLease {
    pub runner_id: String,
    pub expires_at: DateTime<Utc>,
}

impl StageLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A unit of execution within an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: Uuid,
    pub execution_id: Uuid,
    /// Position in the pipeline document
    pub number: i32,
    pub name: String,
    /// Names of stages that must succeed first
    pub depends_on: Vec<String>,
    /// Labels a runner must carry to claim this stage
    pub labels: Vec<String>,
    pub status: StageStatus,
    pub lease: Option<StageLease>,
    /// How many times an expired lease returned the stage to the pool
    pub reclaims: i32,
    /// Set when the runner holding this stage must stop
    pub cancel_requested: bool,
    pub fail_fast: bool,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// An ordered unit of work within a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub stage_id: Uuid,
    pub execution_id: Uuid,
    pub number: i32,
    pub name: String,
    pub image: Option<String>,
    pub commands: Vec<String>,
    pub env: HashMap<String, String>,
    /// Names of secrets the runner should inject
    pub secrets: Vec<String>,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Canceled.is_terminal());

        assert!(!StageStatus::Waiting.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());

        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Failure.is_terminal());
    }

    #[test]
    fn test_status_string_mapping_is_reversible() {
        for status in [
            StageStatus::Waiting,
            StageStatus::Pending,
            StageStatus::Running,
            StageStatus::Success,
            StageStatus::Failure,
            StageStatus::Error,
            StageStatus::Skipped,
            StageStatus::Canceled,
        ] {
            assert_eq!(StageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ExecutionStatus::parse("bogus"), None);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&TriggerCause::PullRequest).unwrap();
        assert_eq!(json, "\"pull_request\"");
        let json = serde_json::to_string(&StageStatus::Canceled).unwrap();
        assert_eq!(json, "\"canceled\"");
    }
}
