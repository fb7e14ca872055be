//! Job Scheduler
//!
//! A storage-backed queue of background jobs. One-off jobs are enqueued under
//! a caller-chosen id that doubles as the deduplication key. Recurring jobs
//! carry an interval or cron schedule and additionally run under the
//! `jobs:recurring:{id}` lock, so exactly one instance executes a given tick.
//!
//! Every state change is published on the `jobs` stream.

pub mod maintenance;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use gantry_core::domain::event::{JobEvent, JobEventKind, streams};
use gantry_core::domain::job::{Job, JobSchedule, JobState};

use crate::bus::EventBus;
use crate::bus::consumer::backoff;
use crate::clock::{SharedClock, to_chrono};
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::lock::{LockError, LockManager};
use crate::repository::JobRepository;

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: &JobContext) -> Result<serde_json::Value>;
}

/// What a handler sees of the job it runs
pub struct JobContext {
    pub job_id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    /// 1 for the first try
    pub attempt: u32,
    /// The tick this run belongs to
    pub scheduled_for: DateTime<Utc>,
    bus: EventBus,
}

impl JobContext {
    /// Publishes a progress event for observers of the `jobs` stream
    pub async fn progress(&self, percent: u8, message: impl Into<String>) -> Result<()> {
        let event = JobEvent {
            job_id: self.job_id.clone(),
            job_kind: self.kind.clone(),
            kind: JobEventKind::Progress,
            state: JobState::Running,
            attempt: self.attempt,
            progress: Some(percent.min(100)),
            message: Some(message.into()),
            result: None,
        };
        self.bus
            .publish_json(streams::JOBS, &self.job_id, &event)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Accepted,
    /// A job with this id already exists, whatever its state
    Duplicate,
}

pub struct JobScheduler {
    jobs: Arc<dyn JobRepository>,
    locks: LockManager,
    bus: EventBus,
    clock: SharedClock,
    config: SchedulerConfig,
    worker_id: String,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobScheduler {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        locks: LockManager,
        bus: EventBus,
        clock: SharedClock,
        config: SchedulerConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            jobs,
            locks,
            bus,
            clock,
            config,
            worker_id: worker_id.into(),
            handlers: HashMap::new(),
        }
    }

    pub fn with_handler(mut self, kind: &str, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(kind.to_string(), handler);
        self
    }

    /// Queues a one-off job; re-enqueueing a known id is a no-op
    pub async fn enqueue(
        &self,
        id: &str,
        kind: &str,
        payload: serde_json::Value,
        run_at: DateTime<Utc>,
    ) -> Result<Enqueued> {
        let job = self.new_job(id, kind, payload, JobSchedule::Once, run_at);
        if self.jobs.insert_if_absent(&job).await? {
            debug!(job_id = id, kind, %run_at, "Job enqueued");
            Ok(Enqueued::Accepted)
        } else {
            debug!(job_id = id, "Duplicate enqueue ignored");
            Ok(Enqueued::Duplicate)
        }
    }

    /// Registers a recurring job; an already registered id keeps its record
    pub async fn register_recurring(
        &self,
        id: &str,
        kind: &str,
        schedule: JobSchedule,
        payload: serde_json::Value,
    ) -> Result<Enqueued> {
        if matches!(schedule, JobSchedule::Once) {
            return Err(Error::Validation(format!(
                "recurring job {} needs an interval or cron schedule",
                id
            )));
        }
        let first_run = next_run(&schedule, self.clock.now())?;
        let job = self.new_job(id, kind, payload, schedule, first_run);
        if self.jobs.insert_if_absent(&job).await? {
            info!(job_id = id, kind, %first_run, "Recurring job registered");
            Ok(Enqueued::Accepted)
        } else {
            Ok(Enqueued::Duplicate)
        }
    }

    pub async fn get(&self, id: &str) -> Result<Job> {
        self.jobs
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))
    }

    pub async fn list(&self, state: JobState, limit: u32) -> Result<Vec<Job>> {
        Ok(self.jobs.list_by_state(state, limit).await?)
    }

    /// Runs every due job once; returns how many were claimed
    pub async fn tick(&self) -> Result<usize> {
        let now = self.clock.now();
        let lease_until = now + to_chrono(self.config.job_lease);
        let claimed = self
            .jobs
            .claim_due(now, &self.worker_id, lease_until, self.config.batch_size)
            .await?;
        let count = claimed.len();

        let runs = claimed.into_iter().map(|job| self.execute(job));
        for outcome in futures::future::join_all(runs).await {
            if let Err(e) = outcome {
                warn!(error = %e, "Job bookkeeping failed");
            }
        }
        Ok(count)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.worker_id, "Job scheduler started");
        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "Scheduler tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!("Job scheduler stopped");
    }

    async fn execute(&self, mut job: Job) -> Result<()> {
        let lock = if job.is_recurring() {
            let key = LockManager::key("jobs:recurring", &job.id);
            match self.locks.hold(&key, self.config.recurring_lock_lease).await {
                Ok(held) => Some(held),
                Err(LockError::Busy(_)) => {
                    debug!(job_id = %job.id, "Recurring job running elsewhere");
                    job.state = JobState::Scheduled;
                    job.lease_holder = None;
                    job.lease_expires_at = None;
                    self.jobs.store_result(&job, &self.worker_id).await?;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };
        let lease = self.keep_lease(&job.id);

        let attempt = job.attempts + 1;
        let ctx = JobContext {
            job_id: job.id.clone(),
            kind: job.kind.clone(),
            payload: job.payload.clone(),
            attempt,
            scheduled_for: job.run_at,
            bus: self.bus.clone(),
        };
        self.publish(&job, JobEventKind::Started, attempt, None, None)
            .await;

        let outcome = match self.handlers.get(&job.kind) {
            Some(handler) => handler.run(&ctx).await,
            None => Err(Error::Validation(format!(
                "no handler registered for job kind {}",
                job.kind
            ))),
        };
        lease.stop();

        let lock_lost = lock.as_ref().is_some_and(|held| held.ensure_held().is_err());
        if lease.is_lost() || lock_lost {
            warn!(job_id = %job.id, attempt, "Job lease lost before completion, outcome discarded");
            if let Some(held) = lock {
                if let Err(e) = held.release().await {
                    debug!(job_id = %job.id, error = %e, "Recurring job lock release failed");
                }
            }
            return Ok(());
        }

        let now = self.clock.now();
        let holder = self.worker_id.clone();
        job.lease_holder = None;
        job.lease_expires_at = None;
        job.updated_at = now;

        let event = match outcome {
            Ok(result) => {
                debug!(job_id = %job.id, attempt, "Job succeeded");
                job.last_error = None;
                job.result = Some(result.clone());
                job.attempts = 0;
                if job.is_recurring() {
                    job.state = JobState::Scheduled;
                    job.run_at = next_run(&job.schedule, now)?;
                } else {
                    job.state = JobState::Succeeded;
                }
                (JobEventKind::Succeeded, None, Some(result))
            }
            Err(e) => {
                job.attempts = attempt;
                job.last_error = Some(e.to_string());
                if attempt >= job.max_attempts {
                    error!(job_id = %job.id, attempt, error = %e, "Job is dead");
                    job.state = JobState::Dead;
                    (JobEventKind::Dead, Some(e.to_string()), None)
                } else if job.is_recurring() {
                    // Retried on the next tick so the tick a run belongs to stays stable
                    warn!(job_id = %job.id, attempt, error = %e, "Recurring job failed");
                    job.state = JobState::Scheduled;
                    job.run_at = next_run(&job.schedule, now)?;
                    (JobEventKind::Failed, Some(e.to_string()), None)
                } else {
                    let delay = backoff(self.config.backoff_base, self.config.backoff_max, attempt);
                    warn!(job_id = %job.id, attempt, ?delay, error = %e, "Job failed, retrying");
                    job.state = JobState::Scheduled;
                    job.run_at = now + to_chrono(delay);
                    (JobEventKind::Failed, Some(e.to_string()), None)
                }
            }
        };

        if !self.jobs.store_result(&job, &holder).await? {
            warn!(job_id = %job.id, "Job was taken over by another worker");
        }
        if let Some(held) = lock {
            held.release().await?;
        }

        let (kind, message, result) = event;
        self.publish(&job, kind, attempt, message, result).await;
        Ok(())
    }

    /// Renews the claim on a running job in the background until stopped
    fn keep_lease(&self, job_id: &str) -> JobLease {
        let lost = Arc::new(AtomicBool::new(false));
        let lease = self.config.job_lease;
        let period = (lease / 3).max(Duration::from_millis(10));
        let jobs = self.jobs.clone();
        let clock = self.clock.clone();
        let holder = self.worker_id.clone();
        let id = job_id.to_string();
        let flag = lost.clone();

        let renewer = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let now = clock.now();
                match jobs.renew_lease(&id, &holder, now + to_chrono(lease), now).await {
                    Ok(true) => debug!(job_id = %id, "Job lease renewed"),
                    Ok(false) => {
                        warn!(job_id = %id, "Job lease lost while running");
                        flag.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => warn!(job_id = %id, error = %e, "Job lease renewal failed, retrying"),
                }
            }
        });
        JobLease { lost, renewer }
    }

    async fn publish(
        &self,
        job: &Job,
        kind: JobEventKind,
        attempt: u32,
        message: Option<String>,
        result: Option<serde_json::Value>,
    ) {
        let state = match kind {
            JobEventKind::Started | JobEventKind::Progress => JobState::Running,
            _ => job.state,
        };
        let event = JobEvent {
            job_id: job.id.clone(),
            job_kind: job.kind.clone(),
            kind,
            state,
            attempt,
            progress: None,
            message,
            result,
        };
        // Observers only; a lost job event never fails the job
        if let Err(e) = self.bus.publish_json(streams::JOBS, &job.id, &event).await {
            warn!(job_id = %job.id, error = %e, "Could not publish job event");
        }
    }

    fn new_job(
        &self,
        id: &str,
        kind: &str,
        payload: serde_json::Value,
        schedule: JobSchedule,
        run_at: DateTime<Utc>,
    ) -> Job {
        let now = self.clock.now();
        Job {
            id: id.to_string(),
            kind: kind.to_string(),
            payload,
            state: JobState::Scheduled,
            schedule,
            run_at,
            attempts: 0,
            max_attempts: self.config.max_attempts,
            last_error: None,
            result: None,
            lease_holder: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

struct JobLease {
    lost: Arc<AtomicBool>,
    renewer: JoinHandle<()>,
}

impl JobLease {
    fn stop(&self) {
        self.renewer.abort();
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        self.renewer.abort();
    }
}

/// Next run of a schedule strictly after `after`
pub fn next_run(schedule: &JobSchedule, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match schedule {
        JobSchedule::Once => Ok(after),
        JobSchedule::Interval { seconds } => {
            if *seconds == 0 {
                return Err(Error::Validation("interval must be positive".to_string()));
            }
            Ok(after + chrono::Duration::seconds(*seconds as i64))
        }
        JobSchedule::Cron { expression } => {
            let schedule = cron::Schedule::from_str(expression).map_err(|e| {
                Error::Validation(format!("invalid cron expression {}: {}", expression, e))
            })?;
            schedule.after(&after).next().ok_or_else(|| {
                Error::Validation(format!("cron expression {} never fires again", expression))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::StartFrom;
    use crate::clock::{Clock, ManualClock};
    use crate::config::BusConfig;
    use crate::repository::memory::MemoryStore;
    use chrono::Timelike;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Flaky {
        failures_left: AtomicU32,
        runs: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn run(&self, ctx: &JobContext) -> Result<serde_json::Value> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            ctx.progress(50, "halfway").await?;
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Transient("boom".to_string()));
            }
            Ok(serde_json::json!({ "ok": true }))
        }
    }

    #[derive(Default)]
    struct Blocking {
        started: Notify,
        release: Notify,
        runs: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for Blocking {
        async fn run(&self, _ctx: &JobContext) -> Result<serde_json::Value> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.release.notified().await;
            Ok(serde_json::json!({ "worker": "w1" }))
        }
    }

    fn scheduler_on(
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        worker_id: &str,
    ) -> (JobScheduler, EventBus) {
        let bus = EventBus::new(store.clone(), clock.clone(), BusConfig::default());
        let locks = LockManager::new(store.clone(), clock.clone(), worker_id);
        let config = SchedulerConfig {
            max_attempts: 3,
            job_lease: Duration::from_secs(30),
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(60),
            ..SchedulerConfig::default()
        };
        let scheduler = JobScheduler::new(store, locks, bus.clone(), clock, config, worker_id);
        (scheduler, bus)
    }

    fn scheduler(clock: Arc<ManualClock>, handler: Arc<Flaky>) -> (JobScheduler, EventBus) {
        let (scheduler, bus) = scheduler_on(Arc::new(MemoryStore::new()), clock, "w1");
        (scheduler.with_handler("flaky", handler), bus)
    }

    fn flaky(failures: u32) -> Arc<Flaky> {
        Arc::new(Flaky {
            failures_left: AtomicU32::new(failures),
            runs: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn test_enqueue_deduplicates_by_id() {
        let clock = Arc::new(ManualClock::default());
        let handler = flaky(0);
        let (scheduler, _) = scheduler(clock.clone(), handler.clone());
        let now = clock.now();

        let first = scheduler
            .enqueue("import-1", "flaky", serde_json::Value::Null, now)
            .await
            .unwrap();
        assert_eq!(first, Enqueued::Accepted);
        assert_eq!(scheduler.tick().await.unwrap(), 1);

        let again = scheduler
            .enqueue("import-1", "flaky", serde_json::Value::Null, now)
            .await
            .unwrap();
        assert_eq!(again, Enqueued::Duplicate);
        assert_eq!(scheduler.tick().await.unwrap(), 0);
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            scheduler.get("import-1").await.unwrap().state,
            JobState::Succeeded
        );
    }

    #[tokio::test]
    async fn test_failures_back_off_then_die() {
        let clock = Arc::new(ManualClock::default());
        let handler = flaky(10);
        let (scheduler, bus) = scheduler(clock.clone(), handler.clone());
        scheduler
            .enqueue("export-1", "flaky", serde_json::Value::Null, clock.now())
            .await
            .unwrap();

        assert_eq!(scheduler.tick().await.unwrap(), 1);
        let job = scheduler.get("export-1").await.unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.run_at - clock.now(), chrono::Duration::seconds(10));

        // Not due until the backoff elapsed
        assert_eq!(scheduler.tick().await.unwrap(), 0);
        clock.advance(Duration::from_secs(10));
        assert_eq!(scheduler.tick().await.unwrap(), 1);
        let job = scheduler.get("export-1").await.unwrap();
        assert_eq!(job.run_at - clock.now(), chrono::Duration::seconds(20));

        clock.advance(Duration::from_secs(20));
        assert_eq!(scheduler.tick().await.unwrap(), 1);
        let job = scheduler.get("export-1").await.unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 3);

        clock.advance(Duration::from_secs(3600));
        assert_eq!(scheduler.tick().await.unwrap(), 0);
        assert_eq!(handler.runs.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.list(JobState::Dead, 10).await.unwrap().len(), 1);

        let mut sub = bus.subscribe(streams::JOBS, "t", StartFrom::After(0)).await.unwrap();
        let mut kinds = Vec::new();
        while let Some(event) = sub.next_timeout(Duration::ZERO).await.unwrap() {
            kinds.push(event.decode::<JobEvent>().unwrap().kind);
        }
        assert_eq!(kinds.last(), Some(&JobEventKind::Dead));
        assert!(kinds.contains(&JobEventKind::Progress));
    }

    #[tokio::test]
    async fn test_recurring_job_reschedules_after_each_run() {
        let clock = Arc::new(ManualClock::default());
        let handler = flaky(0);
        let (scheduler, _) = scheduler(clock.clone(), handler.clone());
        scheduler
            .register_recurring(
                "metrics",
                "flaky",
                JobSchedule::Interval { seconds: 60 },
                serde_json::Value::Null,
            )
            .await
            .unwrap();

        assert_eq!(scheduler.tick().await.unwrap(), 0);
        clock.advance(Duration::from_secs(60));
        assert_eq!(scheduler.tick().await.unwrap(), 1);
        assert_eq!(scheduler.tick().await.unwrap(), 0);
        clock.advance(Duration::from_secs(60));
        assert_eq!(scheduler.tick().await.unwrap(), 1);

        let job = scheduler.get("metrics").await.unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(handler.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_recurring_job_dies_after_consecutive_failures() {
        let clock = Arc::new(ManualClock::default());
        let handler = flaky(10);
        let (scheduler, _) = scheduler(clock.clone(), handler.clone());
        scheduler
            .register_recurring(
                "cleanup",
                "flaky",
                JobSchedule::Interval { seconds: 60 },
                serde_json::Value::Null,
            )
            .await
            .unwrap();

        for attempt in 1..=2 {
            clock.advance(Duration::from_secs(60));
            assert_eq!(scheduler.tick().await.unwrap(), 1);
            let job = scheduler.get("cleanup").await.unwrap();
            assert_eq!(job.state, JobState::Scheduled);
            assert_eq!(job.attempts, attempt);
            assert_eq!(job.run_at - clock.now(), chrono::Duration::seconds(60));
        }

        clock.advance(Duration::from_secs(60));
        assert_eq!(scheduler.tick().await.unwrap(), 1);
        let job = scheduler.get("cleanup").await.unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 3);

        clock.advance(Duration::from_secs(600));
        assert_eq!(scheduler.tick().await.unwrap(), 0);
        assert_eq!(handler.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_running_job_keeps_its_lease() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(Blocking::default());
        let (w1, _) = scheduler_on(store.clone(), clock.clone(), "w1");
        let w1 = w1.with_handler("import", handler.clone());
        let (w2, _) = scheduler_on(store, clock.clone(), "w2");
        let w2 = w2.with_handler("import", handler.clone());
        w1.enqueue("import-1", "import", serde_json::Value::Null, clock.now())
            .await
            .unwrap();

        let other_worker = async {
            handler.started.notified().await;
            // Well past the 30s lease, renewed every 10s meanwhile
            for _ in 0..12 {
                clock.advance(Duration::from_secs(5));
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            let claimed = w2.tick().await.unwrap();
            handler.release.notify_one();
            claimed
        };
        let (first, second) = tokio::join!(w1.tick(), other_worker);

        assert_eq!(first.unwrap(), 1);
        assert_eq!(second, 0);
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
        assert_eq!(w1.get("import-1").await.unwrap().state, JobState::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_taken_over_keeps_the_new_outcome() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        let blocking = Arc::new(Blocking::default());
        let (w1, _) = scheduler_on(store.clone(), clock.clone(), "w1");
        let w1 = w1.with_handler("import", blocking.clone());
        let (w2, _) = scheduler_on(store, clock.clone(), "w2");
        let w2 = w2.with_handler("import", flaky(0));
        w1.enqueue("import-1", "import", serde_json::Value::Null, clock.now())
            .await
            .unwrap();

        let other_worker = async {
            blocking.started.notified().await;
            // w1 stalls past its lease without a chance to renew
            clock.advance(Duration::from_secs(31));
            let claimed = w2.tick().await.unwrap();
            tokio::time::sleep(Duration::from_secs(11)).await;
            blocking.release.notify_one();
            claimed
        };
        let (first, second) = tokio::join!(w1.tick(), other_worker);

        assert_eq!(first.unwrap(), 1);
        assert_eq!(second, 1);
        let job = w1.get("import-1").await.unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.result, Some(serde_json::json!({ "ok": true })));
    }

    #[test]
    fn test_cron_next_run() {
        let after = "2026-01-01T10:00:30Z".parse::<DateTime<Utc>>().unwrap();
        let schedule = JobSchedule::Cron {
            expression: "0 */5 * * * *".to_string(),
        };
        let next = next_run(&schedule, after).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (10, 5, 0));

        let bad = JobSchedule::Cron {
            expression: "not cron".to_string(),
        };
        assert!(matches!(next_run(&bad, after), Err(Error::Validation(_))));
    }
}
