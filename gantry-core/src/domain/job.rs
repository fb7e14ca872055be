//! Background job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Background job record
///
/// Jobs are identified by a caller-chosen id, which is also the
/// deduplication key: enqueueing an id that already exists is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Handler name, e.g. `execution.lease-sweep`
    pub kind: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub schedule: JobSchedule,
    /// Earliest time the job may run next
    pub run_at: DateTime<Utc>,
    /// Failed attempts since the last success
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    /// Worker currently running the job
    pub lease_holder: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_recurring(&self) -> bool {
        !matches!(self.schedule, JobSchedule::Once)
    }
}

/// Job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for `run_at`
    Scheduled,
    Running,
    Succeeded,
    /// Attempt ceiling reached; kept for operator inspection
    Dead,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "scheduled" => JobState::Scheduled,
            "running" => JobState::Running,
            "succeeded" => JobState::Succeeded,
            "dead" => JobState::Dead,
            _ => return None,
        })
    }
}

/// When a job runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSchedule {
    /// Runs once at `run_at`
    Once,
    /// Runs every `seconds`
    Interval { seconds: u64 },
    /// Runs on a cron expression (seconds field included)
    Cron { expression: String },
}
