#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use gantry_core::domain::event::{GitEvent, GitEventKind, streams};
use gantry_core::domain::execution::{Stage, StepStatus};
use gantry_core::domain::pipeline::Pipeline;
use gantry_core::domain::trigger::{Trigger, TriggerAction};
use gantry_core::dto::execution::ExecutionDetail;
use gantry_core::dto::pipeline::CreatePipeline;
use gantry_core::dto::runner::{StepAck, StepReport};
use gantry_core::dto::trigger::CreateTrigger;

use gantry_orchestrator::app::App;
use gantry_orchestrator::clock::ManualClock;
use gantry_orchestrator::config::OrchestratorConfig;
use gantry_orchestrator::git::{MemoryCommit, MemoryGitProvider};
use gantry_orchestrator::repository::Repositories;

pub const REPO: &str = "acme/api";
pub const CONFIG_PATH: &str = ".gantry/pipeline.yaml";

pub const BUILD_LINT_DEPLOY: &str = r#"
stages:
  - name: build
    steps:
      - { name: compile, commands: ["cargo build"] }
  - name: lint
    steps:
      - { name: clippy, commands: ["cargo clippy"] }
  - name: deploy
    depends_on: [build, lint]
    steps:
      - { name: ship, commands: ["./ship.sh"] }
"#;

pub struct TestEnv {
    pub app: Arc<App>,
    pub clock: Arc<ManualClock>,
    pub git: Arc<MemoryGitProvider>,
    pub pipeline: Pipeline,
}

/// Configuration tuned for tests: no long-poll waits, short grace
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.instance_id = "test".to_string();
    config.public_url = "http://gantry.test".to_string();
    config.execution.max_poll_wait = Duration::ZERO;
    config.canceler.grace = Duration::from_millis(200);
    config.canceler.check_interval = Duration::from_millis(10);
    config.webhook.backoff_base = Duration::from_millis(10);
    config.webhook.backoff_max = Duration::from_millis(40);
    config.webhook.timeout = Duration::from_secs(2);
    config
}

pub async fn env(document: &str) -> TestEnv {
    env_with(test_config(), document).await
}

/// Memory-backed app with one pipeline whose document sits on `main`
pub async fn env_with(config: OrchestratorConfig, document: &str) -> TestEnv {
    let clock = Arc::new(ManualClock::default());
    let git = Arc::new(MemoryGitProvider::new());
    add_commit(&git, "c0ffee", "initial commit", document, &[]);
    git.set_ref(REPO, "refs/heads/main", "c0ffee");

    let app = App::build(config, Repositories::memory(), git.clone(), clock.clone())
        .expect("valid test configuration");
    let pipeline = app
        .pipelines
        .create_pipeline(CreatePipeline {
            repo_id: REPO.to_string(),
            uid: "ci".to_string(),
            description: None,
            config_path: None,
            default_branch: None,
        })
        .await
        .unwrap();

    TestEnv {
        app,
        clock,
        git,
        pipeline,
    }
}

pub fn add_commit(git: &MemoryGitProvider, sha: &str, message: &str, document: &str, changed: &[&str]) {
    git.add_commit(
        REPO,
        sha,
        MemoryCommit {
            message: message.to_string(),
            files: HashMap::from([(CONFIG_PATH.to_string(), document.to_string())]),
            changed: changed.iter().map(|p| p.to_string()).collect(),
        },
    );
}

impl TestEnv {
    pub async fn trigger_on(&self, ref_patterns: &[&str], path_patterns: &[&str]) -> Trigger {
        self.app
            .pipelines
            .create_trigger(
                self.pipeline.id,
                CreateTrigger {
                    uid: format!("push-{}", Uuid::new_v4().simple()),
                    description: None,
                    actions: vec![TriggerAction::BranchCreated, TriggerAction::BranchUpdated],
                    ref_patterns: ref_patterns.iter().map(|p| p.to_string()).collect(),
                    path_patterns: path_patterns.iter().map(|p| p.to_string()).collect(),
                    enabled: true,
                },
            )
            .await
            .unwrap()
    }

    /// Publishes a branch update and returns its offset
    pub async fn push(&self, branch: &str, before: Option<&str>, after: &str) -> i64 {
        let ref_name = format!("refs/heads/{}", branch);
        self.git.set_ref(REPO, &ref_name, after);
        let event = GitEvent {
            repo_id: REPO.to_string(),
            kind: GitEventKind::BranchUpdated,
            ref_name,
            before: before.map(String::from),
            after: after.to_string(),
            principal: Some("alice".to_string()),
        };
        self.app
            .bus
            .publish_json(streams::GIT, REPO, &event)
            .await
            .unwrap()
    }

    pub async fn detail(&self, execution_id: Uuid) -> ExecutionDetail {
        self.app.executions.get_detail(execution_id).await.unwrap()
    }

    pub async fn claim(&self, runner: &str) -> Option<Stage> {
        self.app
            .executions
            .next_schedulable_stage(runner, &[])
            .await
            .unwrap()
    }

    pub async fn report(&self, step_id: Uuid, runner: &str, status: StepStatus) -> StepAck {
        self.app
            .executions
            .report_step(
                step_id,
                StepReport {
                    runner_id: runner.to_string(),
                    status,
                    exit_code: None,
                    error: None,
                    log: vec![],
                },
            )
            .await
            .unwrap()
    }

    /// Runs every step of a claimed stage to `status`
    pub async fn finish_stage(&self, stage_id: Uuid, runner: &str, status: StepStatus) {
        let steps = self.app.repos.executions.list_steps(stage_id).await.unwrap();
        for step in steps {
            self.report(step.id, runner, StepStatus::Running).await;
            self.report(step.id, runner, status).await;
        }
    }
}
