//! Webhook domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::event::{EventPosition, ExecutionEventKind, GitEventKind, PullReqEventKind};

/// What a webhook is attached to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum WebhookScope {
    /// Receives events of every pipeline in the repository
    Repository(String),
    /// Receives execution events of one pipeline only
    Pipeline(Uuid),
}

/// Event kinds a webhook can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookTrigger {
    BranchCreated,
    BranchUpdated,
    BranchDeleted,
    TagCreated,
    TagUpdated,
    TagDeleted,
    PullreqCreated,
    PullreqReopened,
    PullreqBranchUpdated,
    PullreqClosed,
    PullreqMerged,
    ExecutionCreated,
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionCanceled,
}

impl WebhookTrigger {
    pub fn from_git(kind: GitEventKind) -> Self {
        match kind {
            GitEventKind::BranchCreated => WebhookTrigger::BranchCreated,
            GitEventKind::BranchUpdated => WebhookTrigger::BranchUpdated,
            GitEventKind::BranchDeleted => WebhookTrigger::BranchDeleted,
            GitEventKind::TagCreated => WebhookTrigger::TagCreated,
            GitEventKind::TagUpdated => WebhookTrigger::TagUpdated,
            GitEventKind::TagDeleted => WebhookTrigger::TagDeleted,
        }
    }

    pub fn from_pullreq(kind: PullReqEventKind) -> Self {
        match kind {
            PullReqEventKind::Created => WebhookTrigger::PullreqCreated,
            PullReqEventKind::Reopened => WebhookTrigger::PullreqReopened,
            PullReqEventKind::BranchUpdated => WebhookTrigger::PullreqBranchUpdated,
            PullReqEventKind::Closed => WebhookTrigger::PullreqClosed,
            PullReqEventKind::Merged => WebhookTrigger::PullreqMerged,
        }
    }

    /// Stage-level updates are too chatty for webhooks
    pub fn from_execution(kind: ExecutionEventKind) -> Option<Self> {
        match kind {
            ExecutionEventKind::Created => Some(WebhookTrigger::ExecutionCreated),
            ExecutionEventKind::Started => Some(WebhookTrigger::ExecutionStarted),
            ExecutionEventKind::Completed => Some(WebhookTrigger::ExecutionCompleted),
            ExecutionEventKind::Canceled => Some(WebhookTrigger::ExecutionCanceled),
            ExecutionEventKind::StageUpdated => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WebhookTrigger::BranchCreated => "branch_created",
            WebhookTrigger::BranchUpdated => "branch_updated",
            WebhookTrigger::BranchDeleted => "branch_deleted",
            WebhookTrigger::TagCreated => "tag_created",
            WebhookTrigger::TagUpdated => "tag_updated",
            WebhookTrigger::TagDeleted => "tag_deleted",
            WebhookTrigger::PullreqCreated => "pullreq_created",
            WebhookTrigger::PullreqReopened => "pullreq_reopened",
            WebhookTrigger::PullreqBranchUpdated => "pullreq_branch_updated",
            WebhookTrigger::PullreqClosed => "pullreq_closed",
            WebhookTrigger::PullreqMerged => "pullreq_merged",
            WebhookTrigger::ExecutionCreated => "execution_created",
            WebhookTrigger::ExecutionStarted => "execution_started",
            WebhookTrigger::ExecutionCompleted => "execution_completed",
            WebhookTrigger::ExecutionCanceled => "execution_canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "branch_created" => WebhookTrigger::BranchCreated,
            "branch_updated" => WebhookTrigger::BranchUpdated,
            "branch_deleted" => WebhookTrigger::BranchDeleted,
            "tag_created" => WebhookTrigger::TagCreated,
            "tag_updated" => WebhookTrigger::TagUpdated,
            "tag_deleted" => WebhookTrigger::TagDeleted,
            "pullreq_created" => WebhookTrigger::PullreqCreated,
            "pullreq_reopened" => WebhookTrigger::PullreqReopened,
            "pullreq_branch_updated" => WebhookTrigger::PullreqBranchUpdated,
            "pullreq_closed" => WebhookTrigger::PullreqClosed,
            "pullreq_merged" => WebhookTrigger::PullreqMerged,
            "execution_created" => WebhookTrigger::ExecutionCreated,
            "execution_started" => WebhookTrigger::ExecutionStarted,
            "execution_completed" => WebhookTrigger::ExecutionCompleted,
            "execution_canceled" => WebhookTrigger::ExecutionCanceled,
            _ => return None,
        })
    }
}

/// Externally configured HTTP endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: Uuid,
    pub scope: WebhookScope,
    pub display_name: String,
    pub url: String,
    /// HMAC key for the signature header; never returned by the API
    #[serde(skip_serializing, default)]
    pub secret: String,
    /// Subscribed kinds; empty means all
    pub triggers: Vec<WebhookTrigger>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    pub fn subscribes_to(&self, trigger: WebhookTrigger) -> bool {
        self.triggers.is_empty() || self.triggers.contains(&trigger)
    }
}

/// Outcome of one delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryResult {
    Success,
    /// Network error, timeout, 429 or 5xx
    RetriableError,
    /// Any other non-2xx response
    FatalError,
    /// Not attempted yet; waits behind an earlier delivery to the same webhook
    Queued,
}

impl DeliveryResult {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryResult::Success => "success",
            DeliveryResult::RetriableError => "retriable_error",
            DeliveryResult::FatalError => "fatal_error",
            DeliveryResult::Queued => "queued",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "success" => DeliveryResult::Success,
            "retriable_error" => DeliveryResult::RetriableError,
            "fatal_error" => DeliveryResult::FatalError,
            "queued" => DeliveryResult::Queued,
            _ => return None,
        })
    }
}

/// One attempt to deliver one event to one webhook
///
/// Records are append-only. Retries of the same logical delivery share a
/// `chain_id` and carry increasing `attempt` numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub chain_id: Uuid,
    pub attempt: u32,
    pub trigger: WebhookTrigger,
    /// Source event; absent for operator re-triggers
    pub event: Option<EventPosition>,
    /// Delivery this chain re-sends, for operator re-triggers
    pub retrigger_of: Option<Uuid>,
    pub request_body: String,
    pub result: DeliveryResult,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    /// When the next attempt of this chain is due, if one is planned
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
