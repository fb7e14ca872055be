//! Consumer-group worker loop
//!
//! A [`Consumer`] drives one [`EventHandler`] over one stream. It holds the
//! `bus:{stream}:{group}` lease so only one instance of a group processes a
//! stream at a time, which also keeps per-partition order. Handlers must be
//! idempotent: anything not yet acknowledged is delivered again after a
//! restart or a lost lease.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use gantry_core::domain::event::Event;

use super::{EventBus, StartFrom, Subscription};
use crate::error::{Error, Result};
use crate::lock::{LockError, LockManager};

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Consumer group name
    fn group(&self) -> &'static str;

    async fn handle(&self, event: &Event) -> Result<()>;
}

pub struct Consumer {
    bus: EventBus,
    locks: LockManager,
    stream: String,
    handler: Arc<dyn EventHandler>,
}

impl Consumer {
    pub fn new(
        bus: EventBus,
        locks: LockManager,
        stream: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            bus,
            locks,
            stream: stream.to_string(),
            handler,
        }
    }

    fn lock_key(&self) -> String {
        LockManager::key("bus", format!("{}:{}", self.stream, self.handler.group()))
    }

    /// Runs until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let config = self.bus.config().clone();
        info!(stream = %self.stream, group = self.handler.group(), "Consumer started");

        while !*shutdown.borrow() {
            let held = match self.locks.hold(&self.lock_key(), config.consumer_lease).await {
                Ok(held) => held,
                Err(LockError::Busy(_)) => {
                    debug!(stream = %self.stream, "Consumer group owned by another instance");
                    wait_or_shutdown(&mut shutdown, config.consumer_lease / 2).await;
                    continue;
                }
                Err(e) => {
                    warn!(stream = %self.stream, error = %e, "Could not take consumer lease");
                    wait_or_shutdown(&mut shutdown, config.retry_base).await;
                    continue;
                }
            };

            let mut sub = match self
                .bus
                .subscribe(&self.stream, self.handler.group(), StartFrom::Checkpoint)
                .await
            {
                Ok(sub) => sub,
                Err(e) => {
                    warn!(stream = %self.stream, error = %e, "Subscribe failed");
                    if let Err(e) = held.release().await {
                        debug!(stream = %self.stream, error = %e, "Consumer lease release failed");
                    }
                    wait_or_shutdown(&mut shutdown, config.retry_base).await;
                    continue;
                }
            };

            loop {
                if *shutdown.borrow() || held.ensure_held().is_err() {
                    break;
                }
                let event = tokio::select! {
                    next = sub.next_timeout(config.poll_interval) => next,
                    _ = shutdown.changed() => break,
                };
                match event {
                    Ok(Some(event)) => {
                        if !self.process_with_retry(&mut sub, &event, &mut shutdown).await {
                            break;
                        }
                        if held.ensure_held().is_err() {
                            // Someone else may already be replaying this event
                            break;
                        }
                        if let Err(e) = sub.ack(event.offset).await {
                            warn!(stream = %self.stream, error = %e, "Checkpoint commit failed");
                            sub.rewind();
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(stream = %self.stream, error = %e, "Stream read failed");
                        wait_or_shutdown(&mut shutdown, config.retry_base).await;
                    }
                }
            }

            if let Err(e) = held.release().await {
                debug!(stream = %self.stream, error = %e, "Consumer lease release failed");
            }
        }

        info!(stream = %self.stream, group = self.handler.group(), "Consumer stopped");
    }

    /// Retries transient failures with capped backoff. Returns false if
    /// shutdown interrupted the retries and the event stays unacknowledged.
    async fn process_with_retry(
        &self,
        sub: &mut Subscription,
        event: &Event,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let config = self.bus.config();
        let mut attempt: u32 = 0;
        loop {
            match self.handler.handle(event).await {
                Ok(()) => return true,
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    let delay = backoff(config.retry_base, config.retry_max, attempt);
                    warn!(
                        stream = %self.stream,
                        offset = event.offset,
                        attempt,
                        error = %e,
                        "Handler failed, retrying"
                    );
                    if !wait_or_shutdown(shutdown, delay).await {
                        sub.rewind();
                        return false;
                    }
                }
                Err(e) => {
                    log_skipped(&self.stream, event, &e);
                    return true;
                }
            }
        }
    }

    /// Processes everything currently in the stream, then returns.
    ///
    /// Used by tests and tooling; a transient handler failure stops the pass
    /// with the failing event left unacknowledged.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let handle = self
            .locks
            .acquire(&self.lock_key(), self.bus.config().consumer_lease)
            .await?;
        let outcome = self.drain().await;
        self.locks.release(handle).await?;
        outcome
    }

    async fn drain(&self) -> Result<usize> {
        let mut sub = self
            .bus
            .subscribe(&self.stream, self.handler.group(), StartFrom::Checkpoint)
            .await?;
        let mut processed = 0;
        while let Some(event) = sub.next_timeout(Duration::ZERO).await? {
            match self.handler.handle(&event).await {
                Ok(()) => {}
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => log_skipped(&self.stream, &event, &e),
            }
            sub.ack(event.offset).await?;
            processed += 1;
        }
        Ok(processed)
    }
}

fn log_skipped(stream: &str, event: &Event, err: &Error) {
    if err.is_contention() {
        debug!(stream, offset = event.offset, error = %err, "Event skipped after contention");
    } else {
        error!(stream, offset = event.offset, error = %err, "Event could not be processed, skipping");
    }
}

/// `base × 2^(attempt−1)`, capped at `max`
pub fn backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Sleeps for `delay`; returns false if shutdown was signalled first
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown.changed() => match changed {
            Ok(()) => !*shutdown.borrow(),
            // Sender gone: nobody can ask us to stop any more
            Err(_) => {
                tokio::time::sleep(delay).await;
                true
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::BusConfig;
    use crate::repository::memory::MemoryStore;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Recorder {
        seen: Mutex<Vec<i64>>,
        transient_failures: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn group(&self) -> &'static str {
            "recorder"
        }

        async fn handle(&self, event: &Event) -> Result<()> {
            if self.transient_failures.load(Ordering::SeqCst) > 0 {
                self.transient_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Transient("storage blip".to_string()));
            }
            if event.payload == b"bad" {
                return Err(Error::Validation("malformed".to_string()));
            }
            self.seen.lock().unwrap().push(event.offset);
            Ok(())
        }
    }

    fn setup(failures: u32) -> (EventBus, Consumer, Arc<Recorder>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(SystemClock);
        let bus = EventBus::new(
            store.clone(),
            clock.clone(),
            BusConfig {
                poll_interval: Duration::from_millis(10),
                retry_base: Duration::from_millis(1),
                retry_max: Duration::from_millis(5),
                ..BusConfig::default()
            },
        );
        let locks = LockManager::new(store, clock, "test");
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            transient_failures: AtomicU32::new(failures),
        });
        let consumer = Consumer::new(bus.clone(), locks, "git", recorder.clone());
        (bus, consumer, recorder)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(10);
        assert_eq!(backoff(base, max, 1), Duration::from_secs(1));
        assert_eq!(backoff(base, max, 2), Duration::from_secs(2));
        assert_eq!(backoff(base, max, 3), Duration::from_secs(4));
        assert_eq!(backoff(base, max, 10), max);
    }

    #[tokio::test]
    async fn test_non_retryable_events_are_skipped() {
        let (bus, consumer, recorder) = setup(0);
        bus.publish("git", "r", b"good").await.unwrap();
        bus.publish("git", "r", b"bad").await.unwrap();
        bus.publish("git", "r", b"good").await.unwrap();

        assert_eq!(consumer.run_until_idle().await.unwrap(), 3);
        assert_eq!(*recorder.seen.lock().unwrap(), vec![1, 3]);
        assert_eq!(bus.checkpoint("git", "recorder").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_transient_failure_leaves_event_unacked() {
        let (bus, consumer, recorder) = setup(1);
        bus.publish("git", "r", b"good").await.unwrap();

        assert!(consumer.run_until_idle().await.is_err());
        assert_eq!(bus.checkpoint("git", "recorder").await.unwrap(), None);

        assert_eq!(consumer.run_until_idle().await.unwrap(), 1);
        assert_eq!(*recorder.seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_run_loop_retries_and_stops_on_shutdown() {
        let (bus, consumer, recorder) = setup(2);
        bus.publish("git", "r", b"good").await.unwrap();

        let (tx, rx) = watch::channel(false);
        let worker = tokio::spawn(consumer.run(rx));

        for _ in 0..200 {
            if !recorder.seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        worker.await.unwrap();

        assert_eq!(*recorder.seen.lock().unwrap(), vec![1]);
        assert_eq!(bus.checkpoint("git", "recorder").await.unwrap(), Some(1));
    }
}
