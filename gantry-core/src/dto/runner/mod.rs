//! Runner protocol DTOs
//!
//! Messages exchanged between runners and the orchestrator while a stage is
//! claimed, executed and reported.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::execution::{Stage, Step, StepStatus};
use crate::domain::log::LogLine;
use crate::domain::runner::Runner;

/// Long-poll request for the next runnable stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollRequest {
    /// Unique identifier for the runner
    pub runner_id: String,

    /// Labels this runner carries
    #[serde(default)]
    pub labels: Vec<String>,

    /// How long the orchestrator may hold the request open
    #[serde(default)]
    pub wait_seconds: Option<u64>,
}

/// A stage claimed on behalf of a runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageAssignment {
    pub stage_id: Uuid,
    pub execution_id: Uuid,
    pub lease_expires_at: DateTime<Utc>,
}

/// Lease renewal request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub runner_id: String,
}

/// Lease renewal answer; `cancel` tells the runner to stop the stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub lease_expires_at: DateTime<Utc>,
    pub cancel: bool,
}

/// Everything a runner needs to execute a claimed stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub stage: Stage,
    pub steps: Vec<Step>,
    /// Execution-level environment (commit, refs, params)
    pub env: HashMap<String, String>,
    /// Secret names referenced by any step
    pub secrets: Vec<String>,
}

/// Step status report with an optional log chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub runner_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub log: Vec<LogLine>,
}

/// Answer to a step report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepAck {
    /// Status actually recorded; differs from the report under cancellation
    pub recorded: StepStatus,
    pub cancel: bool,
}

/// A runner with its liveness as seen from the last poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerInfo {
    #[serde(flatten)]
    pub runner: Runner,
    pub online: bool,
}
