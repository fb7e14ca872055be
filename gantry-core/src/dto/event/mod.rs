//! Event ingestion DTOs

use serde::{Deserialize, Serialize};

/// Where an ingested event landed on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Published {
    pub stream: String,
    pub offset: i64,
}
