//! Storage collaborators: the identity roster and the attendance ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_core::IdentityRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("corrupt embedding for {identity_key}: {len} bytes")]
    CorruptEmbedding { identity_key: String, len: usize },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Read side of the enrolled-identity roster.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Every enrolled individual that has a stored embedding.
    async fn load_identities(&self) -> Result<Vec<IdentityRecord>, StoreError>;
}

/// Write side of the attendance ledger.
///
/// Implementations must tolerate repeated calls for the same
/// `(session_id, identity_key)`.
#[async_trait]
pub trait AttendanceStore: Send + Sync {
    async fn mark_present(
        &self,
        session_id: &str,
        identity_key: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// One identity's attendance state within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub session_id: String,
    pub identity_key: String,
    pub display_name: String,
    /// `None` when the identity was never marked present.
    pub marked_at: Option<DateTime<Utc>>,
}

impl AttendanceRecord {
    pub fn is_present(&self) -> bool {
        self.marked_at.is_some()
    }
}

/// Attendance for a whole session, one record per enrolled identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub roster_size: usize,
    pub present: usize,
    pub absent: usize,
    pub records: Vec<AttendanceRecord>,
}

impl SessionSummary {
    pub fn from_records(session_id: &str, records: Vec<AttendanceRecord>) -> Self {
        let present = records.iter().filter(|r| r.is_present()).count();
        Self {
            session_id: session_id.to_string(),
            roster_size: records.len(),
            present,
            absent: records.len() - present,
            records,
        }
    }
}
