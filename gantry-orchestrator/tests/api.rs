mod common;

use reqwest::StatusCode;
use serde_json::{Value, json};

use gantry_core::domain::execution::{ExecutionStatus, StepStatus};
use gantry_core::dto::execution::ExecutionDetail;
use gantry_core::dto::runner::{HeartbeatResponse, StageAssignment, StageDefinition, StepAck};
use gantry_orchestrator::api::create_router;

use common::{BUILD_LINT_DEPLOY, TestEnv, env};

async fn serve(env: &TestEnv) -> String {
    let router = create_router(env.app.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_health_and_error_mapping() {
    let env = env(BUILD_LINT_DEPLOY).await;
    let base = serve(&env).await;
    let client = reqwest::Client::new();

    let health = client.get(format!("{}/health", base)).send().await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    let missing = client
        .get(format!("{}/api/executions/{}", base, uuid::Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    let body: Value = missing.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("not found"));

    let invalid = client
        .post(format!("{}/api/pipelines", base))
        .json(&json!({ "repo_id": "acme/api", "uid": "has spaces" }))
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

    let duplicate = client
        .post(format!("{}/api/pipelines", base))
        .json(&json!({ "repo_id": "acme/api", "uid": "ci" }))
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_runner_protocol_over_http() {
    let env = env("stages: [{ name: build, steps: [{ name: a, commands: [make] }, { name: b, commands: [make test] }] }]").await;
    let base = serve(&env).await;
    let client = reqwest::Client::new();

    // Nothing to do yet
    let idle = client
        .post(format!("{}/api/runner/poll", base))
        .json(&json!({ "runner_id": "r1", "wait_seconds": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(idle.status(), StatusCode::NO_CONTENT);

    let created = client
        .post(format!("{}/api/pipelines/{}/executions", base, env.pipeline.id))
        .json(&json!({ "params": { "TARGET": "prod" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let execution: Value = created.json().await.unwrap();
    assert_eq!(execution["number"], 1);

    let assignment: StageAssignment = client
        .post(format!("{}/api/runner/poll", base))
        .json(&json!({ "runner_id": "r1", "wait_seconds": 0 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let definition: StageDefinition = client
        .get(format!("{}/api/runner/stages/{}", base, assignment.stage_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(definition.steps.len(), 2);
    assert_eq!(definition.env["TARGET"], "prod");

    let beat: HeartbeatResponse = client
        .post(format!("{}/api/runner/stages/{}/heartbeat", base, assignment.stage_id))
        .json(&json!({ "runner_id": "r1" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(!beat.cancel);

    let stranger = client
        .post(format!("{}/api/runner/stages/{}/heartbeat", base, assignment.stage_id))
        .json(&json!({ "runner_id": "r2" }))
        .send()
        .await
        .unwrap();
    assert_eq!(stranger.status(), StatusCode::CONFLICT);

    for step in &definition.steps {
        for status in [StepStatus::Running, StepStatus::Success] {
            let ack: StepAck = client
                .post(format!("{}/api/runner/steps/{}", base, step.id))
                .json(&json!({
                    "runner_id": "r1",
                    "status": status,
                    "log": [{ "timestamp": "2026-01-01T00:00:00Z", "source": "stdout", "message": "ok" }]
                }))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert_eq!(ack.recorded, status);
            assert!(!ack.cancel);
        }
    }

    let detail: ExecutionDetail = client
        .get(format!("{}/api/executions/{}", base, assignment.execution_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(detail.execution.status, ExecutionStatus::Success);

    let logs: Vec<Value> = client
        .get(format!("{}/api/steps/{}/logs", base, definition.steps[0].id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(logs.len(), 2);

    let runners: Vec<Value> = client
        .get(format!("{}/api/runners", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(runners.len(), 1);
    assert_eq!(runners[0]["id"], "r1");
    assert_eq!(runners[0]["online"], true);
}

#[tokio::test]
async fn test_event_ingestion_reaches_the_trigger_engine() {
    let env = env(BUILD_LINT_DEPLOY).await;
    env.trigger_on(&["refs/heads/main"], &[]).await;
    let base = serve(&env).await;
    let client = reqwest::Client::new();

    let accepted = client
        .post(format!("{}/api/events/git", base))
        .json(&json!({
            "repo_id": "acme/api",
            "kind": "branch_updated",
            "ref_name": "refs/heads/main",
            "before": null,
            "after": "c0ffee",
            "principal": "alice"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);

    env.app.drain_events().await.unwrap();
    let executions: Vec<Value> = client
        .get(format!("{}/api/pipelines/{}/executions", base, env.pipeline.id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0]["cause"], "push");
}
