//! Pipeline Service
//!
//! Business logic for pipeline and trigger management.

use std::sync::Arc;
use uuid::Uuid;

use gantry_core::domain::pipeline::Pipeline;
use gantry_core::domain::trigger::Trigger;
use gantry_core::dto::pipeline::CreatePipeline;
use gantry_core::dto::trigger::CreateTrigger;

use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::repository::{PipelineRepository, RepoError, TriggerRepository};
use crate::trigger::rules::build_globset;

const DEFAULT_CONFIG_PATH: &str = ".gantry/pipeline.yaml";
const DEFAULT_BRANCH: &str = "main";

pub struct PipelineService {
    pipelines: Arc<dyn PipelineRepository>,
    triggers: Arc<dyn TriggerRepository>,
    clock: SharedClock,
}

impl PipelineService {
    pub fn new(
        pipelines: Arc<dyn PipelineRepository>,
        triggers: Arc<dyn TriggerRepository>,
        clock: SharedClock,
    ) -> Self {
        Self {
            pipelines,
            triggers,
            clock,
        }
    }

    /// Create a new pipeline; the uid must be unique within the repository
    pub async fn create_pipeline(&self, req: CreatePipeline) -> Result<Pipeline> {
        validate_pipeline_request(&req)?;

        let now = self.clock.now();
        let pipeline = Pipeline {
            id: Uuid::new_v4(),
            repo_id: req.repo_id,
            uid: req.uid,
            description: req.description,
            config_path: req
                .config_path
                .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string()),
            default_branch: req
                .default_branch
                .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            seq: 0,
            created_at: now,
            updated_at: now,
        };

        match self.pipelines.create(&pipeline).await {
            Ok(()) => {}
            Err(RepoError::Conflict(_)) => {
                return Err(Error::Conflict(format!(
                    "pipeline {} already exists in {}",
                    pipeline.uid, pipeline.repo_id
                )));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!("Pipeline created: {} ({})", pipeline.uid, pipeline.id);
        Ok(pipeline)
    }

    pub async fn get_pipeline(&self, id: Uuid) -> Result<Pipeline> {
        self.pipelines
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("pipeline {}", id)))
    }

    /// List pipelines, optionally of one repository
    pub async fn list_pipelines(&self, repo_id: Option<&str>) -> Result<Vec<Pipeline>> {
        let pipelines = match repo_id {
            Some(repo_id) => self.pipelines.list_by_repo(repo_id).await?,
            None => self.pipelines.list_all().await?,
        };
        Ok(pipelines)
    }

    pub async fn delete_pipeline(&self, id: Uuid) -> Result<()> {
        if !self.pipelines.delete(id).await? {
            return Err(Error::NotFound(format!("pipeline {}", id)));
        }
        tracing::info!("Pipeline deleted: {}", id);
        Ok(())
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    /// Attach a trigger rule; glob patterns are checked up front
    pub async fn create_trigger(&self, pipeline_id: Uuid, req: CreateTrigger) -> Result<Trigger> {
        self.get_pipeline(pipeline_id).await?;
        validate_trigger_request(&req)?;

        let now = self.clock.now();
        let trigger = Trigger {
            id: Uuid::new_v4(),
            pipeline_id,
            uid: req.uid,
            description: req.description,
            actions: req.actions,
            ref_patterns: req.ref_patterns,
            path_patterns: req.path_patterns,
            enabled: req.enabled,
            created_at: now,
            updated_at: now,
        };

        match self.triggers.create(&trigger).await {
            Ok(()) => {}
            Err(RepoError::Conflict(_)) => {
                return Err(Error::Conflict(format!(
                    "trigger {} already exists on pipeline {}",
                    trigger.uid, pipeline_id
                )));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!("Trigger created: {} on pipeline {}", trigger.uid, pipeline_id);
        Ok(trigger)
    }

    pub async fn list_triggers(&self, pipeline_id: Uuid) -> Result<Vec<Trigger>> {
        self.get_pipeline(pipeline_id).await?;
        Ok(self.triggers.list_by_pipeline(pipeline_id).await?)
    }

    pub async fn enable_trigger(&self, id: Uuid) -> Result<Trigger> {
        self.set_trigger_enabled(id, true).await
    }

    pub async fn disable_trigger(&self, id: Uuid) -> Result<Trigger> {
        self.set_trigger_enabled(id, false).await
    }

    async fn set_trigger_enabled(&self, id: Uuid, enabled: bool) -> Result<Trigger> {
        if !self
            .triggers
            .set_enabled(id, enabled, self.clock.now())
            .await?
        {
            return Err(Error::NotFound(format!("trigger {}", id)));
        }
        tracing::info!("Trigger {} {}", id, if enabled { "enabled" } else { "disabled" });
        self.triggers
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("trigger {}", id)))
    }
}

// =============================================================================
// Validation
// =============================================================================

fn validate_pipeline_request(req: &CreatePipeline) -> Result<()> {
    if req.repo_id.trim().is_empty() {
        return Err(Error::Validation(
            "Repository id cannot be empty".to_string(),
        ));
    }

    validate_uid("Pipeline", &req.uid)?;

    if let Some(path) = &req.config_path {
        if path.trim().is_empty() || path.starts_with('/') || path.split('/').any(|c| c == "..") {
            return Err(Error::Validation(format!(
                "Config path must be relative to the repository root: {}",
                path
            )));
        }
    }

    if let Some(branch) = &req.default_branch {
        if branch.trim().is_empty() {
            return Err(Error::Validation(
                "Default branch cannot be empty".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_trigger_request(req: &CreateTrigger) -> Result<()> {
    validate_uid("Trigger", &req.uid)?;
    build_globset(&req.ref_patterns)?;
    build_globset(&req.path_patterns)?;
    Ok(())
}

fn validate_uid(what: &str, uid: &str) -> Result<()> {
    if uid.trim().is_empty() {
        return Err(Error::Validation(format!("{} uid cannot be empty", what)));
    }

    if uid.len() > 100 {
        return Err(Error::Validation(format!(
            "{} uid is too long (max 100 characters)",
            what
        )));
    }

    if !uid
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::Validation(format!(
            "{} uid may only contain letters, digits, '-', '_' and '.'",
            what
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::repository::Repositories;
    use gantry_core::domain::trigger::TriggerAction;

    fn service() -> PipelineService {
        let repos = Repositories::memory();
        PipelineService::new(repos.pipelines, repos.triggers, Arc::new(SystemClock))
    }

    fn create(uid: &str) -> CreatePipeline {
        CreatePipeline {
            repo_id: "acme/api".to_string(),
            uid: uid.to_string(),
            description: None,
            config_path: None,
            default_branch: None,
        }
    }

    #[tokio::test]
    async fn test_pipeline_defaults_and_uniqueness() {
        let svc = service();
        let pipeline = svc.create_pipeline(create("ci")).await.unwrap();
        assert_eq!(pipeline.config_path, ".gantry/pipeline.yaml");
        assert_eq!(pipeline.default_branch, "main");

        let err = svc.create_pipeline(create("ci")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(matches!(
            svc.create_pipeline(create("no spaces")).await.unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_trigger_validation_and_toggle() {
        let svc = service();
        let pipeline = svc.create_pipeline(create("ci")).await.unwrap();

        let bad = CreateTrigger {
            uid: "push".to_string(),
            description: None,
            actions: vec![],
            ref_patterns: vec!["refs/heads/[".to_string()],
            path_patterns: vec![],
            enabled: true,
        };
        let err = svc.create_trigger(pipeline.id, bad).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let trigger = svc
            .create_trigger(
                pipeline.id,
                CreateTrigger {
                    uid: "push".to_string(),
                    description: None,
                    actions: vec![TriggerAction::BranchUpdated],
                    ref_patterns: vec!["refs/heads/*".to_string()],
                    path_patterns: vec![],
                    enabled: true,
                },
            )
            .await
            .unwrap();

        let disabled = svc.disable_trigger(trigger.id).await.unwrap();
        assert!(!disabled.enabled);
        let enabled = svc.enable_trigger(trigger.id).await.unwrap();
        assert!(enabled.enabled);
        assert!(matches!(
            svc.enable_trigger(Uuid::new_v4()).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }
}
