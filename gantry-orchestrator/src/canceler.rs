//! Canceler
//!
//! Carries out `execution.cancel.requested` events. Stages that have not
//! started are canceled right away; running stages get the signal on their
//! next heartbeat and have `grace` to acknowledge before they are
//! force-canceled.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gantry_core::domain::event::{CancelRequest, Event, streams};
use gantry_core::domain::execution::{Execution, ExecutionStatus};
use gantry_core::dto::execution::CancelExecution;

use crate::bus::EventBus;
use crate::bus::consumer::EventHandler;
use crate::config::CancelerConfig;
use crate::error::Result;
use crate::execution::{CancelPhase, ExecutionManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    AlreadyFinished(ExecutionStatus),
    Canceled {
        /// Running stages whose runner stopped within the grace period
        acknowledged: usize,
        /// Running stages canceled after the grace period
        forced: usize,
    },
}

pub struct Canceler {
    executions: Arc<ExecutionManager>,
    bus: EventBus,
    config: CancelerConfig,
}

impl Canceler {
    pub fn new(executions: Arc<ExecutionManager>, bus: EventBus, config: CancelerConfig) -> Self {
        Self {
            executions,
            bus,
            config,
        }
    }

    /// Publishes a cancel request for the canceler consumer to carry out.
    ///
    /// Finished executions are returned untouched.
    pub async fn request(&self, execution_id: Uuid, req: CancelExecution) -> Result<Execution> {
        let execution = self.executions.get(execution_id).await?;
        if execution.status.is_terminal() {
            debug!(execution_id = %execution_id, status = %execution.status, "Cancel of finished execution ignored");
            return Ok(execution);
        }

        let request = CancelRequest {
            execution_id,
            reason: req.reason.unwrap_or_else(|| "canceled by operator".to_string()),
            requested_by: req.requested_by,
        };
        self.bus
            .publish_json(
                streams::EXECUTION_CANCEL,
                &execution_id.to_string(),
                &request,
            )
            .await?;
        info!(execution_id = %execution_id, reason = %request.reason, "Cancellation requested");
        Ok(execution)
    }

    /// Cancels an execution and waits for its running stages, force-canceling
    /// whatever is still running at the grace deadline
    pub async fn cancel(&self, execution_id: Uuid, reason: &str) -> Result<CancelOutcome> {
        let running = match self.executions.begin_cancel(execution_id, reason).await? {
            CancelPhase::AlreadyFinished(status) => {
                debug!(execution_id = %execution_id, status = %status, "Execution already finished");
                return Ok(CancelOutcome::AlreadyFinished(status));
            }
            CancelPhase::Draining { running } => running,
        };
        if running.is_empty() {
            return Ok(CancelOutcome::Canceled {
                acknowledged: 0,
                forced: 0,
            });
        }

        let deadline = Instant::now() + self.config.grace;
        loop {
            if self.executions.stages_settled(&running).await? {
                debug!(execution_id = %execution_id, stages = running.len(), "Runners acknowledged cancellation");
                return Ok(CancelOutcome::Canceled {
                    acknowledged: running.len(),
                    forced: 0,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.config.check_interval.min(deadline - now)).await;
        }

        let forced = self.executions.force_cancel(execution_id).await?;
        if forced > 0 {
            warn!(execution_id = %execution_id, forced, "Grace period over, stages force-canceled");
        }
        Ok(CancelOutcome::Canceled {
            acknowledged: running.len().saturating_sub(forced),
            forced,
        })
    }
}

#[async_trait]
impl EventHandler for Canceler {
    fn group(&self) -> &'static str {
        "canceler"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let request: CancelRequest = event.decode()?;
        let outcome = self.cancel(request.execution_id, &request.reason).await?;
        debug!(execution_id = %request.execution_id, ?outcome, "Cancel request handled");
        Ok(())
    }
}
