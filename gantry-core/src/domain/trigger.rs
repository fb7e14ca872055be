//! Trigger rule domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::event::{GitEventKind, PullReqEventKind};

/// Repository action a trigger can react to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerAction {
    BranchCreated,
    BranchUpdated,
    TagCreated,
    TagUpdated,
    PullreqCreated,
    PullreqReopened,
    PullreqBranchUpdated,
    PullreqClosed,
    PullreqMerged,
}

impl TriggerAction {
    /// Deletions never start a pipeline
    pub fn from_git(kind: GitEventKind) -> Option<Self> {
        match kind {
            GitEventKind::BranchCreated => Some(TriggerAction::BranchCreated),
            GitEventKind::BranchUpdated => Some(TriggerAction::BranchUpdated),
            GitEventKind::TagCreated => Some(TriggerAction::TagCreated),
            GitEventKind::TagUpdated => Some(TriggerAction::TagUpdated),
            GitEventKind::BranchDeleted | GitEventKind::TagDeleted => None,
        }
    }

    pub fn from_pullreq(kind: PullReqEventKind) -> Self {
        match kind {
            PullReqEventKind::Created => TriggerAction::PullreqCreated,
            PullReqEventKind::Reopened => TriggerAction::PullreqReopened,
            PullReqEventKind::BranchUpdated => TriggerAction::PullreqBranchUpdated,
            PullReqEventKind::Closed => TriggerAction::PullreqClosed,
            PullReqEventKind::Merged => TriggerAction::PullreqMerged,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TriggerAction::BranchCreated => "branch_created",
            TriggerAction::BranchUpdated => "branch_updated",
            TriggerAction::TagCreated => "tag_created",
            TriggerAction::TagUpdated => "tag_updated",
            TriggerAction::PullreqCreated => "pullreq_created",
            TriggerAction::PullreqReopened => "pullreq_reopened",
            TriggerAction::PullreqBranchUpdated => "pullreq_branch_updated",
            TriggerAction::PullreqClosed => "pullreq_closed",
            TriggerAction::PullreqMerged => "pullreq_merged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "branch_created" => TriggerAction::BranchCreated,
            "branch_updated" => TriggerAction::BranchUpdated,
            "tag_created" => TriggerAction::TagCreated,
            "tag_updated" => TriggerAction::TagUpdated,
            "pullreq_created" => TriggerAction::PullreqCreated,
            "pullreq_reopened" => TriggerAction::PullreqReopened,
            "pullreq_branch_updated" => TriggerAction::PullreqBranchUpdated,
            "pullreq_closed" => TriggerAction::PullreqClosed,
            "pullreq_merged" => TriggerAction::PullreqMerged,
            _ => return None,
        })
    }
}

/// Rule deciding whether a repository event starts a pipeline
///
/// Empty `actions`, `ref_patterns` or `path_patterns` match everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub uid: String,
    pub description: Option<String>,
    pub actions: Vec<TriggerAction>,
    /// Glob patterns over ref names, e.g. `refs/heads/*`
    pub ref_patterns: Vec<String>,
    /// Glob patterns over changed paths, e.g. `src/**`
    pub path_patterns: Vec<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
