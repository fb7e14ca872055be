//! Log buffer
//!
//! Collects step output while a step runs so it can be sent to the
//! orchestrator in batches.

use gantry_core::domain::log::{LogLine, LogSource};
use std::sync::{Arc, Mutex};

/// Thread-safe buffer of pending log lines, shared between the output
/// readers of a step and its log sender
#[derive(Clone, Default)]
pub struct LogBuffer {
    lines: Arc<Mutex<Vec<LogLine>>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, source: LogSource, message: impl Into<String>) {
        self.lines.lock().unwrap().push(LogLine {
            timestamp: chrono::Utc::now(),
            source,
            message: message.into(),
        });
    }

    /// Logs a line emitted by the runner itself
    pub fn system(&self, message: impl Into<String>) {
        self.push(LogSource::System, message);
    }

    /// Returns all buffered lines and clears the buffer
    pub fn drain(&self) -> Vec<LogLine> {
        self.lines.lock().unwrap().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_empties_the_buffer() {
        let buffer = LogBuffer::new();
        let writer = buffer.clone();
        writer.push(LogSource::Stdout, "compiling");
        writer.system("step finished");

        let lines = buffer.drain();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].source, LogSource::Stdout);
        assert_eq!(lines[1].source, LogSource::System);
        assert!(buffer.drain().is_empty());
    }
}
