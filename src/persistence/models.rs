use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Listing row for a saved session; the blob itself is not loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub id: String,
    pub name: String,
    /// Envelope version of the stored blob
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Display for StoredSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}  {}  (v{}, updated {})",
            self.id,
            self.name,
            self.version,
            self.updated_at.format("%Y-%m-%d %H:%M")
        )
    }
}
