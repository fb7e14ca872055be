mod common;

use std::sync::Arc;
use std::time::Duration;

use gantry_core::domain::execution::{ExecutionStatus, StageStatus, StepStatus};
use gantry_core::dto::execution::{CancelExecution, RunPipeline};
use gantry_orchestrator::canceler::CancelOutcome;

use common::{BUILD_LINT_DEPLOY, env};

#[tokio::test]
async fn test_cancel_request_cancels_pending_execution() {
    let env = env(BUILD_LINT_DEPLOY).await;
    let execution = env
        .app
        .executions
        .run_manual(env.pipeline.id, RunPipeline::default())
        .await
        .unwrap();

    let returned = env
        .app
        .canceler
        .request(
            execution.id,
            CancelExecution {
                reason: None,
                requested_by: Some("bob".to_string()),
            },
        )
        .await
        .unwrap();
    // The request only records intent; the canceler consumer acts on it
    assert_eq!(returned.status, ExecutionStatus::Pending);
    env.app.drain_events().await.unwrap();

    let detail = env.detail(execution.id).await;
    assert_eq!(detail.execution.status, ExecutionStatus::Canceled);
    assert_eq!(detail.execution.error.as_deref(), Some("canceled by operator"));
    for stage in &detail.stages {
        assert_eq!(stage.stage.status, StageStatus::Canceled);
        assert!(stage.steps.iter().all(|s| s.status == StepStatus::Canceled));
    }
    assert!(env.claim("r1").await.is_none());
}

#[tokio::test]
async fn test_running_stage_acknowledges_within_grace() {
    let env = Arc::new(env(BUILD_LINT_DEPLOY).await);
    let execution = env
        .app
        .executions
        .run_manual(env.pipeline.id, RunPipeline::default())
        .await
        .unwrap();
    let stage = env.claim("r1").await.unwrap();
    let steps = env.app.repos.executions.list_steps(stage.id).await.unwrap();
    env.report(steps[0].id, "r1", StepStatus::Running).await;

    let canceling = {
        let env = env.clone();
        tokio::spawn(async move { env.app.canceler.cancel(execution.id, "stop").await.unwrap() })
    };

    // The runner learns about it on its next heartbeat and stops
    let mut signaled = false;
    for _ in 0..50 {
        if env.app.executions.heartbeat(stage.id, "r1").await.unwrap().cancel {
            signaled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(signaled);
    let ack = env.report(steps[0].id, "r1", StepStatus::Canceled).await;
    assert_eq!(ack.recorded, StepStatus::Canceled);

    let outcome = canceling.await.unwrap();
    assert_eq!(
        outcome,
        CancelOutcome::Canceled {
            acknowledged: 1,
            forced: 0
        }
    );
    let detail = env.detail(execution.id).await;
    assert_eq!(detail.execution.status, ExecutionStatus::Canceled);
    assert_eq!(detail.stage_by_id(stage.id).unwrap().stage.status, StageStatus::Canceled);
}

#[tokio::test]
async fn test_silent_runner_is_force_canceled_and_late_success_is_ignored() {
    let env = env(BUILD_LINT_DEPLOY).await;
    let execution = env
        .app
        .executions
        .run_manual(env.pipeline.id, RunPipeline::default())
        .await
        .unwrap();
    let stage = env.claim("r1").await.unwrap();
    let steps = env.app.repos.executions.list_steps(stage.id).await.unwrap();
    env.report(steps[0].id, "r1", StepStatus::Running).await;

    let outcome = env.app.canceler.cancel(execution.id, "stop").await.unwrap();
    assert_eq!(
        outcome,
        CancelOutcome::Canceled {
            acknowledged: 0,
            forced: 1
        }
    );

    // The runner finally reports success; nothing moves backwards
    let ack = env.report(steps[0].id, "r1", StepStatus::Success).await;
    assert!(ack.cancel);
    let detail = env.detail(execution.id).await;
    assert_eq!(detail.execution.status, ExecutionStatus::Canceled);
    let stage = detail.stage_by_id(stage.id).unwrap();
    assert_eq!(stage.stage.status, StageStatus::Canceled);
    assert_eq!(stage.steps[0].status, StepStatus::Canceled);
}

#[tokio::test]
async fn test_cancel_after_completion_changes_nothing() {
    let env = env("stages: [{ name: only, steps: [{ name: x, commands: [make] }] }]").await;
    let execution = env
        .app
        .executions
        .run_manual(env.pipeline.id, RunPipeline::default())
        .await
        .unwrap();
    let stage = env.claim("r1").await.unwrap();
    env.finish_stage(stage.id, "r1", StepStatus::Success).await;

    let outcome = env.app.canceler.cancel(execution.id, "late").await.unwrap();
    assert_eq!(outcome, CancelOutcome::AlreadyFinished(ExecutionStatus::Success));
    let execution = env.app.executions.get(execution.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Success);
    assert_eq!(execution.error, None);
}
