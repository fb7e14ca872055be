mod common;

use std::time::Duration;

use gantry_core::domain::check::CheckStatus;
use gantry_core::domain::event::{MetricsSnapshot, streams};
use gantry_core::domain::execution::{StepStatus, TriggerCause};
use gantry_core::domain::job::JobState;
use gantry_core::dto::execution::RunPipeline;

use gantry_orchestrator::clock::Clock;
use gantry_orchestrator::scheduler::Enqueued;
use gantry_orchestrator::scheduler::maintenance::{CronRun, register_maintenance, schedule_pipeline};

use common::{BUILD_LINT_DEPLOY, REPO, env};

const SINGLE_STAGE: &str = r#"
stages:
  - name: test
    steps:
      - { name: unit, commands: ["cargo test"] }
"#;

#[tokio::test]
async fn test_cron_schedule_runs_the_pipeline_once_per_tick() {
    let env = env(BUILD_LINT_DEPLOY).await;
    let run = || CronRun {
        pipeline_id: env.pipeline.id,
        branch: None,
        params: Default::default(),
    };

    let (id, first) = schedule_pipeline(&env.app.scheduler, "*/10 * * * * *", run())
        .await
        .unwrap();
    assert_eq!(first, Enqueued::Accepted);
    let (_, again) = schedule_pipeline(&env.app.scheduler, "*/10 * * * * *", run())
        .await
        .unwrap();
    assert_eq!(again, Enqueued::Duplicate);

    assert_eq!(env.app.scheduler.tick().await.unwrap(), 0, "not due yet");

    env.clock.advance(Duration::from_secs(11));
    assert_eq!(env.app.scheduler.tick().await.unwrap(), 1);
    assert_eq!(env.app.scheduler.tick().await.unwrap(), 0, "one run per tick");

    let executions = env.app.executions.list(env.pipeline.id, 10).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].cause, TriggerCause::Cron);
    assert_eq!(executions[0].refs.source_ref, "refs/heads/main");

    let job = env.app.scheduler.get(&id).await.unwrap();
    assert_eq!(job.state, JobState::Scheduled);
    assert!(job.run_at > env.clock.now());
}

#[tokio::test]
async fn test_invalid_cron_expression_is_rejected() {
    let env = env(BUILD_LINT_DEPLOY).await;
    let run = CronRun {
        pipeline_id: env.pipeline.id,
        branch: None,
        params: Default::default(),
    };
    assert!(schedule_pipeline(&env.app.scheduler, "every tuesday", run).await.is_err());
}

#[tokio::test]
async fn test_commit_check_follows_execution_status() {
    let env = env(SINGLE_STAGE).await;
    let execution = env
        .app
        .executions
        .run_manual(env.pipeline.id, RunPipeline::default())
        .await
        .unwrap();

    let checks = env.app.checks.list(REPO, "c0ffee").await.unwrap();
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0].uid, "ci");
    assert_eq!(checks[0].status, CheckStatus::Pending);
    assert!(checks[0].link.ends_with(&execution.id.to_string()));

    let stage = env.claim("r1").await.unwrap();
    env.finish_stage(stage.id, "r1", StepStatus::Success).await;

    let checks = env.app.checks.list(REPO, "c0ffee").await.unwrap();
    assert_eq!(checks.len(), 1, "one check per pipeline and commit");
    assert_eq!(checks[0].status, CheckStatus::Success);
}

#[tokio::test]
async fn test_metrics_job_publishes_a_snapshot() {
    let env = env(SINGLE_STAGE).await;
    env.app
        .executions
        .run_manual(env.pipeline.id, RunPipeline::default())
        .await
        .unwrap();

    let config = env.app.config.maintenance.clone();
    register_maintenance(&env.app.scheduler, &config).await.unwrap();
    env.clock.advance(config.metrics_interval + Duration::from_secs(1));
    env.app.scheduler.tick().await.unwrap();

    let events = env.app.bus.read(streams::METRICS, 0, 10).await.unwrap();
    assert_eq!(events.len(), 1);
    let snapshot: MetricsSnapshot = events[0].decode().unwrap();
    assert_eq!(snapshot.pipelines, 1);
    assert_eq!(snapshot.executions.get("pending"), Some(&1));
}
