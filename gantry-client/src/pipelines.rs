//! Pipeline, trigger and schedule endpoints

use uuid::Uuid;

use gantry_core::domain::check::Check;
use gantry_core::domain::pipeline::Pipeline;
use gantry_core::domain::trigger::Trigger;
use gantry_core::dto::pipeline::{CreatePipeline, SchedulePipeline, ScheduleResponse};
use gantry_core::dto::trigger::CreateTrigger;

use crate::OrchestratorClient;
use crate::error::Result;

impl OrchestratorClient {
    // =============================================================================
    // Pipeline Management
    // =============================================================================

    /// Register a pipeline for a repository
    pub async fn create_pipeline(&self, req: CreatePipeline) -> Result<Pipeline> {
        let response = self
            .client
            .post(self.url("/api/pipelines"))
            .json(&req)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// List pipelines, optionally only those of one repository
    pub async fn list_pipelines(&self, repo_id: Option<&str>) -> Result<Vec<Pipeline>> {
        let mut request = self.client.get(self.url("/api/pipelines"));
        if let Some(repo_id) = repo_id {
            request = request.query(&[("repo_id", repo_id)]);
        }
        let response = request.send().await?;

        self.handle_response(response).await
    }

    pub async fn get_pipeline(&self, pipeline_id: Uuid) -> Result<Pipeline> {
        let response = self
            .client
            .get(self.url(&format!("/api/pipelines/{}", pipeline_id)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    pub async fn delete_pipeline(&self, pipeline_id: Uuid) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/api/pipelines/{}", pipeline_id)))
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    // =============================================================================
    // Triggers
    // =============================================================================

    pub async fn create_trigger(&self, pipeline_id: Uuid, req: CreateTrigger) -> Result<Trigger> {
        let response = self
            .client
            .post(self.url(&format!("/api/pipelines/{}/triggers", pipeline_id)))
            .json(&req)
            .send()
            .await?;

        self.handle_response(response).await
    }

    pub async fn list_triggers(&self, pipeline_id: Uuid) -> Result<Vec<Trigger>> {
        let response = self
            .client
            .get(self.url(&format!("/api/pipelines/{}/triggers", pipeline_id)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Enable or disable a trigger
    pub async fn set_trigger_enabled(&self, trigger_id: Uuid, enabled: bool) -> Result<Trigger> {
        let action = if enabled { "enable" } else { "disable" };
        let response = self
            .client
            .post(self.url(&format!("/api/triggers/{}/{}", trigger_id, action)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Schedules & Checks
    // =============================================================================

    /// Run a pipeline on a cron schedule
    ///
    /// Scheduling the same expression twice returns the existing job with
    /// `created` set to false.
    pub async fn schedule_pipeline(
        &self,
        pipeline_id: Uuid,
        req: SchedulePipeline,
    ) -> Result<ScheduleResponse> {
        let response = self
            .client
            .post(self.url(&format!("/api/pipelines/{}/schedule", pipeline_id)))
            .json(&req)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Commit statuses reported for a commit
    pub async fn list_checks(&self, repo_id: &str, commit_sha: &str) -> Result<Vec<Check>> {
        let response = self
            .client
            .get(self.url("/api/checks"))
            .query(&[("repo_id", repo_id), ("commit_sha", commit_sha)])
            .send()
            .await?;

        self.handle_response(response).await
    }
}
