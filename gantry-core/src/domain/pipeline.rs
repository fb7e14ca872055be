//! Pipeline domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline definition
///
/// A pipeline points at a configuration document inside a repository.
/// The document itself is resolved from git at execution time, so the
/// stored record only carries its location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    /// Owning repository identifier
    pub repo_id: String,
    /// Human readable identifier, unique within the repository
    pub uid: String,
    pub description: Option<String>,
    /// Path of the configuration document inside the repository
    pub config_path: String,
    /// Branch used for manual and cron runs when none is given
    pub default_branch: String,
    /// Last execution number handed out for this pipeline
    pub seq: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
