mod common;

use std::time::Duration;

use gantry_core::domain::event::streams;
use gantry_core::domain::execution::{ExecutionStatus, TriggerCause};
use gantry_orchestrator::config::DebouncePolicy;

use common::{BUILD_LINT_DEPLOY, add_commit, env, env_with, test_config};

#[tokio::test]
async fn test_push_starts_one_execution_and_replay_is_a_noop() {
    let env = env(BUILD_LINT_DEPLOY).await;
    env.trigger_on(&["refs/heads/main"], &[]).await;
    add_commit(&env.git, "abc123", "fix: things", BUILD_LINT_DEPLOY, &["src/lib.rs"]);

    env.push("main", Some("c0ffee"), "abc123").await;
    env.app.drain_events().await.unwrap();

    let executions = env.app.executions.list(env.pipeline.id, 10).await.unwrap();
    assert_eq!(executions.len(), 1);
    let execution = &executions[0];
    assert_eq!(execution.cause, TriggerCause::Push);
    assert_eq!(execution.refs.commit_sha, "abc123");
    assert_eq!(execution.refs.before_sha.as_deref(), Some("c0ffee"));
    assert_eq!(execution.triggered_by.as_deref(), Some("alice"));

    // Replaying the same event, as after a crash before the checkpoint
    let events = env.app.bus.read(streams::GIT, 0, 10).await.unwrap();
    assert_eq!(events.len(), 1);
    let replayed = env.app.triggers.evaluate(&events[0]).await.unwrap();
    assert_eq!(replayed.len(), 1);
    assert!(!replayed[0].is_new());
    assert_eq!(replayed[0].execution().id, execution.id);

    let executions = env.app.executions.list(env.pipeline.id, 10).await.unwrap();
    assert_eq!(executions.len(), 1);
}

#[tokio::test]
async fn test_skip_marker_suppresses_the_run() {
    let env = env(BUILD_LINT_DEPLOY).await;
    env.trigger_on(&[], &[]).await;
    add_commit(&env.git, "d0c5", "docs: typo [SKIP CI]", BUILD_LINT_DEPLOY, &["README.md"]);

    env.push("main", Some("c0ffee"), "d0c5").await;
    env.app.drain_events().await.unwrap();

    assert!(env.app.executions.list(env.pipeline.id, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_ref_and_path_filters() {
    let env = env(BUILD_LINT_DEPLOY).await;
    env.trigger_on(&["refs/heads/release/*"], &["src/**"]).await;
    add_commit(&env.git, "aaa", "docs only", BUILD_LINT_DEPLOY, &["docs/guide.md"]);
    add_commit(&env.git, "bbb", "code", BUILD_LINT_DEPLOY, &["src/main.rs"]);

    // Wrong branch
    env.push("main", None, "bbb").await;
    // Right branch, no matching path
    env.push("release/1.0", None, "aaa").await;
    // Both match
    env.push("release/1.0", Some("aaa"), "bbb").await;
    env.app.drain_events().await.unwrap();

    let executions = env.app.executions.list(env.pipeline.id, 10).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].refs.source_ref, "refs/heads/release/1.0");
    assert_eq!(executions[0].refs.commit_sha, "bbb");
}

#[tokio::test]
async fn test_disabled_trigger_never_fires() {
    let env = env(BUILD_LINT_DEPLOY).await;
    let trigger = env.trigger_on(&[], &[]).await;
    env.app.pipelines.disable_trigger(trigger.id).await.unwrap();
    add_commit(&env.git, "abc", "feat", BUILD_LINT_DEPLOY, &[]);

    env.push("main", None, "abc").await;
    env.app.drain_events().await.unwrap();

    assert!(env.app.executions.list(env.pipeline.id, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_document_is_skipped_without_blocking_the_stream() {
    let env = env(BUILD_LINT_DEPLOY).await;
    env.trigger_on(&[], &[]).await;
    add_commit(&env.git, "bad", "broken", "stages: [ { name: a, depends_on: [zzz] } ]", &[]);
    add_commit(&env.git, "good", "fixed", BUILD_LINT_DEPLOY, &[]);

    env.push("main", None, "bad").await;
    env.push("main", Some("bad"), "good").await;
    env.app.drain_events().await.unwrap();

    let executions = env.app.executions.list(env.pipeline.id, 10).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].refs.commit_sha, "good");
}

#[tokio::test]
async fn test_newer_push_supersedes_pending_execution() {
    let mut config = test_config();
    config.trigger.debounce = DebouncePolicy::SupersedePending {
        window: Duration::from_secs(60),
    };
    let env = env_with(config, BUILD_LINT_DEPLOY).await;
    env.trigger_on(&["refs/heads/main"], &[]).await;
    add_commit(&env.git, "one", "first", BUILD_LINT_DEPLOY, &[]);
    add_commit(&env.git, "two", "second", BUILD_LINT_DEPLOY, &[]);
    add_commit(&env.git, "three", "third", BUILD_LINT_DEPLOY, &[]);

    env.push("main", None, "one").await;
    env.app.drain_events().await.unwrap();
    env.push("main", Some("one"), "two").await;
    env.app.drain_events().await.unwrap();

    let mut executions = env.app.executions.list(env.pipeline.id, 10).await.unwrap();
    executions.sort_by_key(|e| e.number);
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0].status, ExecutionStatus::Canceled);
    assert_eq!(executions[0].error.as_deref(), Some("superseded"));
    assert_eq!(executions[1].status, ExecutionStatus::Pending);

    // Outside the window the pending run is kept
    env.clock.advance(Duration::from_secs(120));
    env.push("main", Some("two"), "three").await;
    env.app.drain_events().await.unwrap();
    let second = env.app.executions.get(executions[1].id).await.unwrap();
    assert_eq!(second.status, ExecutionStatus::Pending);
}
