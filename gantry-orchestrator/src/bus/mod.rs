//! Event Bus
//!
//! Durable publish/subscribe over named streams, backed by an [`EventLog`].
//! `publish` returns only once the event is recorded and carries its
//! per-stream offset. Consumers pull through a [`Subscription`] bound to a
//! consumer group and commit progress explicitly with [`Subscription::ack`];
//! after a crash the group resumes from its last acknowledged offset, so
//! delivery is at-least-once.

pub mod consumer;

pub use consumer::{Consumer, EventHandler};

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use gantry_core::domain::event::Event;

use crate::clock::SharedClock;
use crate::config::BusConfig;
use crate::error::Result;
use crate::repository::EventLog;

#[derive(Clone)]
pub struct EventBus {
    log: Arc<dyn EventLog>,
    clock: SharedClock,
    config: BusConfig,
    published: Arc<Notify>,
}

/// Where a new subscription starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// After the group's last acknowledged offset, or the beginning
    Checkpoint,
    /// After an explicit offset (0 replays the whole stream)
    After(i64),
}

impl EventBus {
    pub fn new(log: Arc<dyn EventLog>, clock: SharedClock, config: BusConfig) -> Self {
        Self {
            log,
            clock,
            config,
            published: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Durably appends an event and returns its offset
    pub async fn publish(&self, stream: &str, partition_key: &str, payload: &[u8]) -> Result<i64> {
        let event = self
            .log
            .append(stream, partition_key, payload, self.clock.now())
            .await?;
        debug!(stream, offset = event.offset, partition_key, "Event published");
        self.published.notify_waiters();
        Ok(event.offset)
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        stream: &str,
        partition_key: &str,
        value: &T,
    ) -> Result<i64> {
        let payload = serde_json::to_vec(value)?;
        self.publish(stream, partition_key, &payload).await
    }

    pub async fn subscribe(&self, stream: &str, group: &str, from: StartFrom) -> Result<Subscription> {
        let acked = self.log.load_checkpoint(stream, group).await?.unwrap_or(0);
        let position = match from {
            StartFrom::Checkpoint => acked,
            StartFrom::After(offset) => offset.max(0),
        };

        Ok(Subscription {
            bus: self.clone(),
            stream: stream.to_string(),
            group: group.to_string(),
            position,
            acked,
            buffer: VecDeque::new(),
        })
    }

    /// Last offset a consumer group acknowledged
    pub async fn checkpoint(&self, stream: &str, group: &str) -> Result<Option<i64>> {
        Ok(self.log.load_checkpoint(stream, group).await?)
    }

    /// Reads a stream slice without touching any consumer group
    pub async fn read(&self, stream: &str, after: i64, limit: u32) -> Result<Vec<Event>> {
        Ok(self.log.read(stream, after, limit).await?)
    }
}

/// Pull-based cursor of one consumer group over one stream
pub struct Subscription {
    bus: EventBus,
    stream: String,
    group: String,
    /// Offset of the last event handed out
    position: i64,
    acked: i64,
    buffer: VecDeque<Event>,
}

impl Subscription {
    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn acked_offset(&self) -> i64 {
        self.acked
    }

    /// Waits for the next event; never returns `None`
    pub async fn next(&mut self) -> Result<Event> {
        loop {
            if let Some(event) = self.next_timeout(self.bus.config.poll_interval).await? {
                return Ok(event);
            }
        }
    }

    /// Next event, or `None` if nothing arrives within `wait`
    pub async fn next_timeout(&mut self, wait: Duration) -> Result<Option<Event>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(event) = self.buffer.pop_front() {
                self.position = event.offset;
                return Ok(Some(event));
            }

            // Register interest before reading so a publish in between is not missed
            let published = self.bus.published.notified();
            tokio::pin!(published);
            published.as_mut().enable();

            let batch = self
                .bus
                .log
                .read(&self.stream, self.position, self.bus.config.batch_size)
                .await?;
            if !batch.is_empty() {
                self.buffer.extend(batch);
                continue;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // Publishers in other processes do not notify; fall back to polling
            let nap = (deadline - now).min(self.bus.config.poll_interval);
            tokio::select! {
                _ = &mut published => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// Durably records progress up to `offset`; never moves backwards
    pub async fn ack(&mut self, offset: i64) -> Result<()> {
        if offset <= self.acked {
            return Ok(());
        }
        self.bus
            .log
            .store_checkpoint(&self.stream, &self.group, offset)
            .await?;
        self.acked = offset;
        Ok(())
    }

    /// Forgets unacknowledged progress so those events are delivered again
    pub fn rewind(&mut self) {
        self.buffer.clear();
        self.position = self.acked;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::repository::memory::MemoryStore;

    fn bus() -> EventBus {
        EventBus::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
            BusConfig {
                poll_interval: Duration::from_millis(20),
                ..BusConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_publish_assigns_increasing_offsets() {
        let bus = bus();
        let first = bus.publish("git", "acme/api", b"a").await.unwrap();
        let second = bus.publish("git", "acme/web", b"b").await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_unacked_events_are_redelivered_after_restart() {
        let bus = bus();
        for payload in [b"1", b"2", b"3"] {
            bus.publish("git", "acme/api", payload).await.unwrap();
        }

        let mut sub = bus.subscribe("git", "g", StartFrom::Checkpoint).await.unwrap();
        let first = sub.next().await.unwrap();
        sub.ack(first.offset).await.unwrap();
        let second = sub.next().await.unwrap();
        assert_eq!(second.payload, b"2");
        drop(sub);

        // Crash before acking the second event
        let mut sub = bus.subscribe("git", "g", StartFrom::Checkpoint).await.unwrap();
        let replayed = sub.next().await.unwrap();
        assert_eq!(replayed.offset, second.offset);
    }

    #[tokio::test]
    async fn test_groups_track_offsets_independently() {
        let bus = bus();
        bus.publish("git", "acme/api", b"1").await.unwrap();

        let mut a = bus.subscribe("git", "a", StartFrom::Checkpoint).await.unwrap();
        let event = a.next().await.unwrap();
        a.ack(event.offset).await.unwrap();

        let mut b = bus.subscribe("git", "b", StartFrom::Checkpoint).await.unwrap();
        assert_eq!(b.next().await.unwrap().offset, event.offset);
        assert_eq!(bus.checkpoint("git", "a").await.unwrap(), Some(event.offset));
        assert_eq!(bus.checkpoint("git", "b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_waiting_subscriber_wakes_on_publish() {
        let bus = bus();
        let mut sub = bus.subscribe("jobs", "g", StartFrom::Checkpoint).await.unwrap();

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            publisher.publish("jobs", "job-1", b"{}").await.unwrap();
        });

        let event = sub.next_timeout(Duration::from_secs(5)).await.unwrap();
        assert!(event.is_some());
        assert!(sub.next_timeout(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replay_from_explicit_offset() {
        let bus = bus();
        for _ in 0..3 {
            bus.publish("git", "acme/api", b"{}").await.unwrap();
        }
        let mut sub = bus.subscribe("git", "g", StartFrom::After(1)).await.unwrap();
        assert_eq!(sub.next().await.unwrap().offset, 2);

        sub.rewind();
        assert_eq!(sub.next().await.unwrap().offset, 1);
    }
}
