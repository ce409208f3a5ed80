//! Storage traits. The libSQL backend implements both.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;

/// Key-value state with overwrite semantics (watermark, OAuth token).
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError>;

    /// Insert or overwrite.
    async fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError>;
}

/// An item that failed in some batch, kept for operator follow-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub item_id: String,
    pub sender: String,
    pub subject: String,
    /// Pipeline stage that failed, e.g. "validate".
    pub stage: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Append-only log of failed items. Nothing is ever re-queued from it.
#[async_trait]
pub trait FailureLog: Send + Sync {
    async fn record_item_failure(&self, failure: &ItemFailure) -> Result<(), DatabaseError>;

    /// Most recent first.
    async fn recent_item_failures(&self, limit: usize) -> Result<Vec<ItemFailure>, DatabaseError>;
}
