//! Commit status checks
//!
//! Mirrors every execution status change onto the commit it builds, one check
//! per pipeline.

use std::sync::Arc;
use tracing::warn;

use gantry_core::domain::check::{Check, CheckStatus};
use gantry_core::domain::execution::{Execution, ExecutionStatus};

use crate::clock::SharedClock;
use crate::error::Result;
use crate::repository::{CheckRepository, PipelineRepository};

pub struct CheckReporter {
    checks: Arc<dyn CheckRepository>,
    pipelines: Arc<dyn PipelineRepository>,
    clock: SharedClock,
    public_url: String,
}

impl CheckReporter {
    pub fn new(
        checks: Arc<dyn CheckRepository>,
        pipelines: Arc<dyn PipelineRepository>,
        clock: SharedClock,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            checks,
            pipelines,
            clock,
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Upserts the check; failures are logged, never propagated
    pub async fn report(&self, execution: &Execution) {
        if let Err(e) = self.try_report(execution).await {
            warn!(execution_id = %execution.id, error = %e, "Could not update commit check");
        }
    }

    async fn try_report(&self, execution: &Execution) -> Result<()> {
        let Some(pipeline) = self.pipelines.find_by_id(execution.pipeline_id).await? else {
            return Ok(());
        };
        let check = Check {
            repo_id: execution.repo_id.clone(),
            commit_sha: execution.refs.commit_sha.clone(),
            uid: pipeline.uid,
            status: CheckStatus::from(execution.status),
            summary: summary(execution),
            link: format!("{}/api/executions/{}", self.public_url, execution.id),
            updated_at: self.clock.now(),
        };
        self.checks.upsert(&check).await?;
        Ok(())
    }

    pub async fn list(&self, repo_id: &str, commit_sha: &str) -> Result<Vec<Check>> {
        Ok(self.checks.list_for_commit(repo_id, commit_sha).await?)
    }
}

fn summary(execution: &Execution) -> String {
    let what = format!("#{} ({})", execution.number, execution.cause);
    match execution.status {
        ExecutionStatus::Pending => format!("{} is queued", what),
        ExecutionStatus::Running => format!("{} is running", what),
        ExecutionStatus::Success => format!("{} succeeded", what),
        ExecutionStatus::Failure => format!("{} failed", what),
        ExecutionStatus::Error => match &execution.error {
            Some(err) => format!("{} errored: {}", what, err),
            None => format!("{} errored", what),
        },
        ExecutionStatus::Canceled => format!("{} was canceled", what),
    }
}
