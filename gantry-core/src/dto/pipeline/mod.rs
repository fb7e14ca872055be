//! Pipeline DTOs for the operator API

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::job::Job;

/// Request to register a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePipeline {
    pub repo_id: String,
    pub uid: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Defaults to `.gantry/pipeline.yaml`
    #[serde(default)]
    pub config_path: Option<String>,
    /// Defaults to `main`
    #[serde(default)]
    pub default_branch: Option<String>,
}

/// Request to run a pipeline on a cron schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulePipeline {
    /// Six-field cron expression, seconds first
    pub expression: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleResponse {
    pub job: Job,
    /// False when an identical schedule already existed
    pub created: bool,
}
