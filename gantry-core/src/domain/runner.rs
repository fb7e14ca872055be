//! Runner domain model
//!
//! Represents a remote worker that claims stages from the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A runner seen by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runner {
    /// Unique identifier for the runner
    pub id: String,

    /// Labels matched against stage requirements
    pub labels: Vec<String>,

    /// When this runner first polled
    pub registered_at: DateTime<Utc>,

    /// Last poll or heartbeat
    pub last_seen_at: DateTime<Utc>,
}

impl Runner {
    /// Whether this runner carries every label in `required`
    pub fn satisfies(&self, required: &[String]) -> bool {
        labels_satisfy(&self.labels, required)
    }
}

/// Label matching used for stage assignment
pub fn labels_satisfy(available: &[String], required: &[String]) -> bool {
    required.iter().all(|label| available.contains(label))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_satisfy() {
        let available = vec!["linux".to_string(), "docker".to_string()];
        assert!(labels_satisfy(&available, &[]));
        assert!(labels_satisfy(&available, &["docker".to_string()]));
        assert!(!labels_satisfy(&available, &["gpu".to_string()]));
    }
}
