//! Commit status check domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::execution::ExecutionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pending,
    Running,
    Success,
    Failure,
    Error,
}

impl From<ExecutionStatus> for CheckStatus {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Pending => CheckStatus::Pending,
            ExecutionStatus::Running => CheckStatus::Running,
            ExecutionStatus::Success => CheckStatus::Success,
            ExecutionStatus::Failure => CheckStatus::Failure,
            ExecutionStatus::Error | ExecutionStatus::Canceled => CheckStatus::Error,
        }
    }
}

impl CheckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckStatus::Pending => "pending",
            CheckStatus::Running => "running",
            CheckStatus::Success => "success",
            CheckStatus::Failure => "failure",
            CheckStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => CheckStatus::Pending,
            "running" => CheckStatus::Running,
            "success" => CheckStatus::Success,
            "failure" => CheckStatus::Failure,
            "error" => CheckStatus::Error,
            _ => return None,
        })
    }
}

/// Build status attached to a commit, one per `(repo, commit, uid)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    pub repo_id: String,
    pub commit_sha: String,
    /// Pipeline uid the check reports for
    pub uid: String,
    pub status: CheckStatus,
    pub summary: String,
    pub link: String,
    pub updated_at: DateTime<Utc>,
}
