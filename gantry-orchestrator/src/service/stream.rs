//! Live status and log fan-out
//!
//! In-process broadcast channels feeding the SSE endpoints. Observers that
//! fall behind lose updates; the persisted records stay authoritative.

use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use gantry_core::domain::execution::{Execution, Stage, Step};
use gantry_core::domain::log::LogLine;

/// One observable change within an execution
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StatusUpdate {
    Execution(Execution),
    Stage(Stage),
    Step(Step),
}

impl StatusUpdate {
    pub fn execution_id(&self) -> Uuid {
        match self {
            StatusUpdate::Execution(e) => e.id,
            StatusUpdate::Stage(s) => s.execution_id,
            StatusUpdate::Step(s) => s.execution_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StatusUpdate::Execution(_) => "execution",
            StatusUpdate::Stage(_) => "stage",
            StatusUpdate::Step(_) => "step",
        }
    }
}

/// Broadcast of execution, stage and step status changes
pub struct Streamer {
    tx: broadcast::Sender<StatusUpdate>,
}

impl Streamer {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, update: StatusUpdate) {
        // No receivers is the common case
        let _ = self.tx.send(update);
    }

    /// Updates of one execution, from now on
    pub fn subscribe(&self, execution_id: Uuid) -> BoxStream<'static, StatusUpdate> {
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(move |update| async move {
                match update {
                    Ok(update) if update.execution_id() == execution_id => Some(update),
                    _ => None,
                }
            })
            .boxed()
    }
}

impl Default for Streamer {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Per-step broadcast of freshly appended log lines
pub struct LogStream {
    capacity: usize,
    channels: Mutex<HashMap<Uuid, broadcast::Sender<LogLine>>>,
}

impl LogStream {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn publish(&self, step_id: Uuid, lines: &[LogLine]) {
        let channels = self.channels.lock().unwrap();
        if let Some(tx) = channels.get(&step_id) {
            for line in lines {
                let _ = tx.send(line.clone());
            }
        }
    }

    /// Ends every subscription of a finished step
    pub fn close(&self, step_id: Uuid) {
        self.channels.lock().unwrap().remove(&step_id);
    }

    pub fn subscribe(&self, step_id: Uuid) -> BoxStream<'static, LogLine> {
        let rx = {
            let mut channels = self.channels.lock().unwrap();
            let capacity = self.capacity;
            channels
                .entry(step_id)
                .or_insert_with(|| broadcast::channel(capacity).0)
                .subscribe()
        };
        BroadcastStream::new(rx)
            .filter_map(|line| async move { line.ok() })
            .boxed()
    }
}

impl Default for LogStream {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_stream_ends_when_step_closes() {
        let logs = LogStream::default();
        let step_id = Uuid::new_v4();
        let mut stream = logs.subscribe(step_id);

        logs.publish(step_id, &[LogLine::system("hello")]);
        logs.publish(Uuid::new_v4(), &[LogLine::system("elsewhere")]);
        logs.close(step_id);

        let line = stream.next().await.unwrap();
        assert_eq!(line.message, "hello");
        assert!(stream.next().await.is_none());
    }
}
