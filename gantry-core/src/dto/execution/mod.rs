//! Execution DTOs for the operator API

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::execution::{Execution, Stage, Step};

/// Request to run a pipeline manually
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunPipeline {
    /// Branch to build; the pipeline's default branch when absent
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub triggered_by: Option<String>,
}

/// Request to cancel an execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelExecution {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

/// Execution with its full stage/step tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDetail {
    pub execution: Execution,
    pub stages: Vec<StageDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDetail {
    pub stage: Stage,
    pub steps: Vec<Step>,
}

impl ExecutionDetail {
    pub fn stage(&self, name: &str) -> Option<&StageDetail> {
        self.stages.iter().find(|s| s.stage.name == name)
    }

    pub fn stage_by_id(&self, id: Uuid) -> Option<&StageDetail> {
        self.stages.iter().find(|s| s.stage.id == id)
    }
}
