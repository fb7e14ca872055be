//! Trigger DTOs for the operator API

use serde::{Deserialize, Serialize};

use crate::domain::trigger::TriggerAction;

/// Request to attach a trigger rule to a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTrigger {
    pub uid: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub actions: Vec<TriggerAction>,
    #[serde(default)]
    pub ref_patterns: Vec<String>,
    #[serde(default)]
    pub path_patterns: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}
