//! Runner Service
//!
//! Read side of the runner registry. Runners register implicitly on every
//! poll; this service only lists them.

use chrono::Duration;
use std::sync::Arc;

use gantry_core::domain::runner::Runner;
use gantry_core::dto::runner::RunnerInfo;

use crate::clock::SharedClock;
use crate::error::Result;
use crate::repository::RunnerRepository;

pub struct RunnerService {
    runners: Arc<dyn RunnerRepository>,
    clock: SharedClock,
    /// Runners silent for longer are reported offline
    offline_after: Duration,
}

impl RunnerService {
    pub fn new(runners: Arc<dyn RunnerRepository>, clock: SharedClock, offline_after: Duration) -> Self {
        Self {
            runners,
            clock,
            offline_after,
        }
    }

    pub async fn list_runners(&self) -> Result<Vec<RunnerInfo>> {
        let now = self.clock.now();
        let runners = self.runners.list_all().await?;
        tracing::debug!("Listing {} runners", runners.len());
        Ok(runners
            .into_iter()
            .map(|runner| RunnerInfo {
                online: now - runner.last_seen_at <= self.offline_after,
                runner,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::repository::Repositories;

    #[tokio::test]
    async fn test_silent_runners_are_offline() {
        let repos = Repositories::memory();
        let clock = Arc::new(ManualClock::default());
        let now = clock.now();
        for (id, seen) in [("fresh", now), ("stale", now - Duration::minutes(10))] {
            repos
                .runners
                .upsert(&Runner {
                    id: id.to_string(),
                    labels: vec![],
                    registered_at: seen,
                    last_seen_at: seen,
                })
                .await
                .unwrap();
        }

        let svc = RunnerService::new(repos.runners, clock, Duration::minutes(2));
        let runners = svc.list_runners().await.unwrap();
        assert_eq!(runners.len(), 2);
        assert!(runners.iter().find(|r| r.runner.id == "fresh").unwrap().online);
        assert!(!runners.iter().find(|r| r.runner.id == "stale").unwrap().online);
    }
}
