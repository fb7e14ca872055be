//! Background job queue endpoints

use gantry_core::domain::job::{Job, JobState};

use crate::OrchestratorClient;
use crate::error::Result;

impl OrchestratorClient {
    /// List jobs in one state
    pub async fn list_jobs(&self, state: JobState, limit: u32) -> Result<Vec<Job>> {
        let response = self
            .client
            .get(self.url("/api/jobs"))
            .query(&[("state", state.as_str().to_string()), ("limit", limit.to_string())])
            .send()
            .await?;

        self.handle_response(response).await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        let response = self
            .client
            .get(self.url(&format!("/api/jobs/{}", job_id)))
            .send()
            .await?;

        self.handle_response(response).await
    }
}
