//! Trigger Engine
//!
//! Consumes the `git` and `pullreq` streams as the `trigger-engine` group and
//! starts one execution per pipeline whose enabled triggers match the event.
//! The event position is part of the idempotency key, so replays after a
//! crash never start a second run.

pub mod rules;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use gantry_core::domain::event::{
    Event, EventPosition, GitEvent, PullReqEvent, streams,
};
use gantry_core::domain::execution::{ExecutionRefs, TriggerCause};
use gantry_core::domain::pipeline::Pipeline;
use gantry_core::domain::trigger::TriggerAction;

use crate::bus::consumer::EventHandler;
use crate::canceler::Canceler;
use crate::clock::{SharedClock, to_chrono};
use crate::config::{DebouncePolicy, TriggerConfig};
use crate::error::{Error, Result};
use crate::execution::{Created, ExecutionManager, NewExecution};
use crate::git::{GitError, GitProvider, ZERO_SHA};
use crate::repository::{PipelineRepository, TriggerRepository};

use rules::{TriggerRule, has_skip_marker};

/// Normalized view of a git or pull request event
struct Candidate {
    repo_id: String,
    action: TriggerAction,
    /// Ref the trigger patterns are matched against
    match_ref: String,
    cause: TriggerCause,
    refs: ExecutionRefs,
    principal: Option<String>,
}

pub struct TriggerEngine {
    pipelines: Arc<dyn PipelineRepository>,
    triggers: Arc<dyn TriggerRepository>,
    executions: Arc<ExecutionManager>,
    canceler: Arc<Canceler>,
    git: Arc<dyn GitProvider>,
    clock: SharedClock,
    config: TriggerConfig,
}

impl TriggerEngine {
    pub fn new(
        pipelines: Arc<dyn PipelineRepository>,
        triggers: Arc<dyn TriggerRepository>,
        executions: Arc<ExecutionManager>,
        canceler: Arc<Canceler>,
        git: Arc<dyn GitProvider>,
        clock: SharedClock,
        config: TriggerConfig,
    ) -> Self {
        Self {
            pipelines,
            triggers,
            executions,
            canceler,
            git,
            clock,
            config,
        }
    }

    /// Evaluates one event and returns the executions it started (or had
    /// already started, on replay)
    pub async fn evaluate(&self, event: &Event) -> Result<Vec<Created>> {
        let candidate = match event.stream.as_str() {
            streams::GIT => self.from_git(event.decode()?).await?,
            streams::PULLREQ => Some(self.from_pullreq(event.decode()?)),
            other => {
                debug!(stream = other, "Trigger engine ignores stream");
                None
            }
        };
        match candidate {
            Some(candidate) => self.dispatch(&event.position(), candidate).await,
            None => Ok(Vec::new()),
        }
    }

    async fn from_git(&self, git: GitEvent) -> Result<Option<Candidate>> {
        let Some(action) = TriggerAction::from_git(git.kind) else {
            debug!(ref_name = %git.ref_name, "Ref deletion does not trigger");
            return Ok(None);
        };

        let message = self.git.commit_message(&git.repo_id, &git.after).await?;
        if has_skip_marker(&message) {
            info!(repo_id = %git.repo_id, sha = %git.after, "Skip marker in commit message");
            return Ok(None);
        }

        let cause = if git.ref_name.starts_with("refs/tags/") {
            TriggerCause::Tag
        } else {
            TriggerCause::Push
        };
        Ok(Some(Candidate {
            repo_id: git.repo_id,
            action,
            match_ref: git.ref_name.clone(),
            cause,
            refs: ExecutionRefs {
                source_ref: git.ref_name.clone(),
                target_ref: git.ref_name,
                commit_sha: git.after,
                before_sha: git.before.filter(|sha| sha != ZERO_SHA),
            },
            principal: git.principal,
        }))
    }

    fn from_pullreq(&self, pr: PullReqEvent) -> Candidate {
        Candidate {
            repo_id: pr.repo_id,
            action: TriggerAction::from_pullreq(pr.kind),
            // Pull request triggers select on the branch being merged into
            match_ref: pr.target_ref.clone(),
            cause: TriggerCause::PullRequest,
            refs: ExecutionRefs {
                source_ref: pr.source_ref,
                target_ref: pr.target_ref,
                commit_sha: pr.sha,
                before_sha: None,
            },
            principal: pr.principal,
        }
    }

    async fn dispatch(&self, position: &EventPosition, candidate: Candidate) -> Result<Vec<Created>> {
        let pipelines = self.pipelines.list_by_repo(&candidate.repo_id).await?;
        let mut changed: Option<Vec<String>> = None;
        let mut started = Vec::new();

        for pipeline in pipelines {
            if !self
                .pipeline_matches(&pipeline, &candidate, &mut changed)
                .await?
            {
                continue;
            }

            if let DebouncePolicy::SupersedePending { window } = self.config.debounce {
                self.supersede(&pipeline, &candidate.refs.source_ref, window, position)
                    .await?;
            }

            let request = NewExecution {
                pipeline_id: pipeline.id,
                cause: candidate.cause,
                refs: candidate.refs.clone(),
                params: HashMap::new(),
                idempotency_key: Some(format!(
                    "{}:{}:{}",
                    position.stream, position.offset, pipeline.id
                )),
                source_event: Some(position.clone()),
                triggered_by: candidate.principal.clone(),
            };
            match self.executions.create_execution(request).await {
                Ok(created) => started.push(created),
                Err(Error::ConfigInvalid(msg)) => {
                    warn!(pipeline_id = %pipeline.id, error = %msg, "Pipeline document invalid, not started");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(started)
    }

    async fn pipeline_matches(
        &self,
        pipeline: &Pipeline,
        candidate: &Candidate,
        changed: &mut Option<Vec<String>>,
    ) -> Result<bool> {
        let triggers = self.triggers.list_by_pipeline(pipeline.id).await?;
        for trigger in triggers.iter().filter(|t| t.enabled) {
            let rule = match TriggerRule::compile(trigger) {
                Ok(rule) => rule,
                Err(e) => {
                    warn!(trigger_id = %trigger.id, error = %e, "Trigger has invalid patterns");
                    continue;
                }
            };
            if !rule.matches_action(candidate.action) || !rule.matches_ref(&candidate.match_ref) {
                continue;
            }
            if rule.filters_paths() {
                if changed.is_none() {
                    *changed = Some(self.changed_paths(candidate).await?);
                }
                let paths = changed.as_deref().unwrap_or_default();
                if !rule.matches_paths(paths) {
                    continue;
                }
            }
            debug!(pipeline_id = %pipeline.id, trigger = %rule.trigger().uid, "Trigger matched");
            return Ok(true);
        }
        Ok(false)
    }

    async fn changed_paths(&self, candidate: &Candidate) -> Result<Vec<String>> {
        let base = match candidate.cause {
            TriggerCause::PullRequest => {
                match self
                    .git
                    .resolve_ref(&candidate.repo_id, &candidate.refs.target_ref)
                    .await
                {
                    Ok(sha) => Some(sha),
                    Err(GitError::NotFound(_)) => None,
                    Err(e) => return Err(e.into()),
                }
            }
            _ => candidate.refs.before_sha.clone(),
        };
        Ok(self
            .git
            .changed_paths(
                &candidate.repo_id,
                base.as_deref(),
                &candidate.refs.commit_sha,
            )
            .await?)
    }

    /// Cancels pending runs of the same ref created within the window
    async fn supersede(
        &self,
        pipeline: &Pipeline,
        source_ref: &str,
        window: std::time::Duration,
        position: &EventPosition,
    ) -> Result<()> {
        let now = self.clock.now();
        for pending in self
            .executions
            .list_pending_for_ref(pipeline.id, source_ref)
            .await?
        {
            // A replayed event must not cancel the run it started the first time
            if pending.source_event.as_ref() == Some(position) {
                continue;
            }
            if now - pending.created_at > to_chrono(window) {
                continue;
            }
            info!(
                execution_id = %pending.id,
                pipeline_id = %pipeline.id,
                source_ref,
                "Superseding pending execution"
            );
            self.canceler.cancel(pending.id, "superseded").await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for TriggerEngine {
    fn group(&self) -> &'static str {
        "trigger-engine"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let started = self.evaluate(event).await?;
        let new = started.iter().filter(|c| c.is_new()).count();
        if new > 0 {
            info!(stream = %event.stream, offset = event.offset, executions = new, "Event started executions");
        }
        Ok(())
    }
}
