//! Event ingestion and background job endpoints

use gantry_core::domain::event::{GitEvent, PullReqEvent};
use gantry_core::dto::event::Published;

use crate::OrchestratorClient;
use crate::error::Result;

impl OrchestratorClient {
    /// Publish a ref change for the trigger engine and webhooks
    pub async fn publish_git_event(&self, event: &GitEvent) -> Result<Published> {
        let response = self
            .client
            .post(self.url("/api/events/git"))
            .json(event)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Publish a pull request change
    pub async fn publish_pullreq_event(&self, event: &PullReqEvent) -> Result<Published> {
        let response = self
            .client
            .post(self.url("/api/events/pullreq"))
            .json(event)
            .send()
            .await?;

        self.handle_response(response).await
    }
}
