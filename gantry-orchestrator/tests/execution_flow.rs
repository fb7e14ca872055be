mod common;

use std::collections::HashSet;
use std::sync::Arc;

use gantry_core::domain::execution::{ExecutionStatus, StageStatus, StepStatus};
use gantry_core::dto::execution::RunPipeline;

use common::{BUILD_LINT_DEPLOY, env};

#[tokio::test]
async fn test_failing_lint_skips_deploy_and_fails_execution() {
    let env = env(BUILD_LINT_DEPLOY).await;
    let execution = env
        .app
        .executions
        .run_manual(env.pipeline.id, RunPipeline::default())
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Pending);

    let first = env.claim("r1").await.unwrap();
    let second = env.claim("r2").await.unwrap();
    let names: HashSet<_> = [first.name.as_str(), second.name.as_str()].into_iter().collect();
    assert_eq!(names, HashSet::from(["build", "lint"]));
    assert!(env.claim("r3").await.is_none(), "deploy must wait for both");

    let ((build, build_runner), (lint, lint_runner)) = if first.name == "build" {
        ((first, "r1"), (second, "r2"))
    } else {
        ((second, "r2"), (first, "r1"))
    };

    env.finish_stage(lint.id, lint_runner, StepStatus::Failure).await;
    env.finish_stage(build.id, build_runner, StepStatus::Success).await;

    let detail = env.detail(execution.id).await;
    assert_eq!(detail.stage("build").unwrap().stage.status, StageStatus::Success);
    assert_eq!(detail.stage("lint").unwrap().stage.status, StageStatus::Failure);
    assert_eq!(detail.stage("deploy").unwrap().stage.status, StageStatus::Skipped);
    assert_eq!(detail.execution.status, ExecutionStatus::Failure);
    assert!(detail.execution.finished_at.is_some());
    assert!(env.claim("r3").await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_get_distinct_consecutive_numbers() {
    let env = Arc::new(env(BUILD_LINT_DEPLOY).await);

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let env = env.clone();
        tasks.push(tokio::spawn(async move {
            env.app
                .executions
                .run_manual(env.pipeline.id, RunPipeline::default())
                .await
                .unwrap()
                .number
        }));
    }
    let mut numbers = Vec::new();
    for task in tasks {
        numbers.push(task.await.unwrap());
    }
    numbers.sort_unstable();
    assert_eq!(numbers, (1..=20).collect::<Vec<i64>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_a_stage_is_claimed_by_exactly_one_runner() {
    let env = Arc::new(
        env("stages: [{ name: only, steps: [{ name: x, commands: [make] }] }]").await,
    );
    env.app
        .executions
        .run_manual(env.pipeline.id, RunPipeline::default())
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let env = env.clone();
        tasks.push(tokio::spawn(async move {
            env.claim(&format!("runner-{}", i)).await.is_some()
        }));
    }
    let mut claimed = 0;
    for task in tasks {
        if task.await.unwrap() {
            claimed += 1;
        }
    }
    assert_eq!(claimed, 1);
}

const DIAMOND: &str = r#"
stages:
  - { name: a, steps: [{ name: x, commands: [make] }] }
  - { name: b, steps: [{ name: x, commands: [make] }] }
  - { name: c, depends_on: [a, b], steps: [{ name: x, commands: [make] }] }
  - { name: d, depends_on: [b], steps: [{ name: x, commands: [make] }] }
  - { name: e, depends_on: [c, d], steps: [{ name: x, commands: [make] }] }
"#;

/// Completes whatever is claimable in a scrambled order and checks that no
/// stage ever starts before all of its dependencies succeeded
#[tokio::test]
async fn test_dependencies_gate_claims_in_any_completion_order() {
    for seed in 0..6u64 {
        let env = env(DIAMOND).await;
        let execution = env
            .app
            .executions
            .run_manual(env.pipeline.id, RunPipeline::default())
            .await
            .unwrap();

        let mut in_flight = Vec::new();
        let mut round = 0u64;
        loop {
            while let Some(stage) = env.claim("r").await {
                let detail = env.detail(execution.id).await;
                for dep in &stage.depends_on {
                    assert_eq!(
                        detail.stage(dep).unwrap().stage.status,
                        StageStatus::Success,
                        "seed {}: {} claimed before {}",
                        seed,
                        stage.name,
                        dep
                    );
                }
                in_flight.push(stage);
            }
            if in_flight.is_empty() {
                break;
            }
            // Seed-dependent pick so completion order varies between runs
            let pick = ((seed * 7 + round * 3) as usize) % in_flight.len();
            let stage = in_flight.swap_remove(pick);
            env.finish_stage(stage.id, "r", StepStatus::Success).await;
            round += 1;
        }
        assert_eq!(round, 5, "seed {}", seed);

        let detail = env.detail(execution.id).await;
        assert_eq!(detail.execution.status, ExecutionStatus::Success, "seed {}", seed);
    }
}
