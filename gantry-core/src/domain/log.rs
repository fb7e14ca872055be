//! Step log types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One line of step output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub source: LogSource,
    pub message: String,
}

impl LogLine {
    pub fn system(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            source: LogSource::System,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Emitted by the runner itself
    System,
}

impl LogSource {
    pub fn as_str(self) -> &'static str {
        match self {
            LogSource::Stdout => "stdout",
            LogSource::Stderr => "stderr",
            LogSource::System => "system",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "stdout" => LogSource::Stdout,
            "stderr" => LogSource::Stderr,
            _ => LogSource::System,
        }
    }
}
