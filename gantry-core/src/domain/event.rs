//! Event bus domain types
//!
//! Events are immutable records in a named stream. The bus assigns each one
//! a per-stream offset at publish time; `(stream, offset)` identifies an event
//! for its whole lifetime and doubles as an idempotency key for consumers.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::domain::execution::Execution;
use crate::domain::job::JobState;

/// Well-known stream names
pub mod streams {
    pub const GIT: &str = "git";
    pub const PULLREQ: &str = "pullreq";
    pub const EXECUTION: &str = "execution";
    pub const EXECUTION_CANCEL: &str = "execution.cancel";
    pub const JOBS: &str = "jobs";
    pub const METRICS: &str = "metrics";
}

/// A published event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub stream: String,
    pub offset: i64,
    pub partition_key: String,
    /// Opaque payload bytes; producers in this workspace write JSON
    pub payload: Vec<u8>,
    pub produced_at: DateTime<Utc>,
}

impl Event {
    pub fn position(&self) -> EventPosition {
        EventPosition {
            stream: self.stream.clone(),
            offset: self.offset,
        }
    }

    /// Decodes the payload as JSON
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Stable position of an event in the bus
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventPosition {
    pub stream: String,
    pub offset: i64,
}

impl fmt::Display for EventPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stream, self.offset)
    }
}

// =============================================================================
// Repository events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitEventKind {
    BranchCreated,
    BranchUpdated,
    BranchDeleted,
    TagCreated,
    TagUpdated,
    TagDeleted,
}

/// A ref mutation in a repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitEvent {
    pub repo_id: String,
    pub kind: GitEventKind,
    /// Full ref name, e.g. `refs/heads/main`
    pub ref_name: String,
    pub before: Option<String>,
    pub after: String,
    pub principal: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullReqEventKind {
    Created,
    Reopened,
    BranchUpdated,
    Closed,
    Merged,
}

/// A pull request lifecycle change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullReqEvent {
    pub repo_id: String,
    pub number: i64,
    pub kind: PullReqEventKind,
    pub source_ref: String,
    pub target_ref: String,
    /// Head commit of the source branch
    pub sha: String,
    pub principal: Option<String>,
}

// =============================================================================
// Orchestration events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionEventKind {
    Created,
    Started,
    StageUpdated,
    Completed,
    Canceled,
}

impl ExecutionEventKind {
    pub fn name(self) -> &'static str {
        match self {
            ExecutionEventKind::Created => "execution.created",
            ExecutionEventKind::Started => "execution.started",
            ExecutionEventKind::StageUpdated => "execution.stage_updated",
            ExecutionEventKind::Completed => "execution.completed",
            ExecutionEventKind::Canceled => "execution.canceled",
        }
    }
}

/// Execution state change, published on the `execution` stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub kind: ExecutionEventKind,
    pub execution: Execution,
    /// Stage that changed, for `StageUpdated`
    pub stage_id: Option<Uuid>,
}

/// `execution.cancel.requested`, published on the `execution.cancel` stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub execution_id: Uuid,
    pub reason: String,
    pub requested_by: Option<String>,
}

/// `metrics.collected`, published on the `metrics` stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub pipelines: u64,
    /// Execution counts keyed by status
    pub executions: BTreeMap<String, u64>,
    pub runners: u64,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Started,
    Progress,
    Succeeded,
    Failed,
    Dead,
}

/// Background job progress, published on the `jobs` stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub job_kind: String,
    pub kind: JobEventKind,
    pub state: JobState,
    pub attempt: u32,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub result: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_payload() {
        let git = GitEvent {
            repo_id: "acme/api".to_string(),
            kind: GitEventKind::BranchUpdated,
            ref_name: "refs/heads/main".to_string(),
            before: Some("a".repeat(40)),
            after: "b".repeat(40),
            principal: None,
        };
        let event = Event {
            stream: streams::GIT.to_string(),
            offset: 7,
            partition_key: git.repo_id.clone(),
            payload: serde_json::to_vec(&git).unwrap(),
            produced_at: Utc::now(),
        };

        let decoded: GitEvent = event.decode().unwrap();
        assert_eq!(decoded, git);
        assert_eq!(event.position().to_string(), "git:7");
    }
}
