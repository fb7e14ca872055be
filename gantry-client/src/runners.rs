//! Runner protocol endpoints

use reqwest::StatusCode;
use std::time::Duration;
use uuid::Uuid;

use gantry_core::domain::execution::StepStatus;
use gantry_core::domain::log::LogLine;
use gantry_core::dto::runner::{
    HeartbeatRequest, HeartbeatResponse, PollRequest, RunnerInfo, StageAssignment,
    StageDefinition, StepAck, StepReport,
};

use crate::OrchestratorClient;
use crate::error::Result;

impl OrchestratorClient {
    // =============================================================================
    // Stage Claims
    // =============================================================================

    /// Long-poll for the next runnable stage
    ///
    /// Returns `None` when nothing became runnable within `wait`. Polling also
    /// registers the runner, so there is no separate registration call.
    pub async fn poll(
        &self,
        runner_id: &str,
        labels: &[String],
        wait: Duration,
    ) -> Result<Option<StageAssignment>> {
        let response = self
            .client
            .post(self.url("/api/runner/poll"))
            // The server may hold the request for the whole wait
            .timeout(wait + Duration::from_secs(30))
            .json(&PollRequest {
                runner_id: runner_id.to_string(),
                labels: labels.to_vec(),
                wait_seconds: Some(wait.as_secs()),
            })
            .send()
            .await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        self.handle_response(response).await.map(Some)
    }

    /// Steps and environment of a claimed stage
    pub async fn fetch_stage(&self, stage_id: Uuid) -> Result<StageDefinition> {
        let response = self
            .client
            .get(self.url(&format!("/api/runner/stages/{}", stage_id)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Extend the lease on a claimed stage
    ///
    /// Fails with a conflict once the lease is lost; `cancel` in the response
    /// asks the runner to stop.
    pub async fn heartbeat(&self, stage_id: Uuid, runner_id: &str) -> Result<HeartbeatResponse> {
        let response = self
            .client
            .post(self.url(&format!("/api/runner/stages/{}/heartbeat", stage_id)))
            .json(&HeartbeatRequest {
                runner_id: runner_id.to_string(),
            })
            .send()
            .await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Step Reports
    // =============================================================================

    /// Report step progress along with any new log lines
    pub async fn report_step(&self, step_id: Uuid, report: &StepReport) -> Result<StepAck> {
        let response = self
            .client
            .post(self.url(&format!("/api/runner/steps/{}", step_id)))
            .json(report)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Append log lines to a running step without changing its status
    pub async fn send_logs(&self, step_id: Uuid, runner_id: &str, log: Vec<LogLine>) -> Result<StepAck> {
        self.report_step(
            step_id,
            &StepReport {
                runner_id: runner_id.to_string(),
                status: StepStatus::Running,
                exit_code: None,
                error: None,
                log,
            },
        )
        .await
    }

    // =============================================================================
    // Runner Query
    // =============================================================================

    /// Runners that have polled, with their liveness
    pub async fn list_runners(&self) -> Result<Vec<RunnerInfo>> {
        let response = self.client.get(self.url("/api/runners")).send().await?;

        self.handle_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode as AxumStatus, routing::post};
    use chrono::Utc;

    async fn serve(router: Router) -> OrchestratorClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        OrchestratorClient::new(format!("http://{}", addr))
    }

    #[tokio::test]
    async fn test_poll_maps_no_content_to_none() {
        let client = serve(Router::new().route(
            "/api/runner/poll",
            post(|| async { AxumStatus::NO_CONTENT }),
        ))
        .await;

        let claimed = client.poll("r1", &[], Duration::ZERO).await.unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_poll_returns_assignment() {
        let stage_id = Uuid::new_v4();
        let client = serve(Router::new().route(
            "/api/runner/poll",
            post(move |Json(req): Json<PollRequest>| async move {
                assert_eq!(req.runner_id, "r1");
                assert_eq!(req.labels, vec!["linux".to_string()]);
                Json(StageAssignment {
                    stage_id,
                    execution_id: Uuid::new_v4(),
                    lease_expires_at: Utc::now(),
                })
            }),
        ))
        .await;

        let claimed = client
            .poll("r1", &["linux".to_string()], Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.stage_id, stage_id);
    }

    #[tokio::test]
    async fn test_lost_lease_surfaces_as_conflict() {
        let client = serve(Router::new().route(
            "/api/runner/stages/{id}/heartbeat",
            post(|| async {
                (
                    AxumStatus::CONFLICT,
                    Json(serde_json::json!({ "error": "lease lost" })),
                )
            }),
        ))
        .await;

        let err = client.heartbeat(Uuid::new_v4(), "r1").await.unwrap_err();
        assert!(err.is_conflict());
        assert!(err.to_string().contains("lease lost"));
    }
}
