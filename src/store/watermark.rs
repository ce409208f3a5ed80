//! The watermark: exclusive lower time bound for the next fetch.
//!
//! Owned by the scheduler. Every change goes through [`WatermarkStore::advance`],
//! which writes to the state store before touching the in-memory value.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

use crate::error::PersistenceError;
use crate::store::traits::StateStore;

/// State key holding the watermark as an RFC 3339 string.
pub const WATERMARK_KEY: &str = "app.last_update";

pub struct WatermarkStore {
    state: Arc<dyn StateStore>,
    current: DateTime<Utc>,
}

impl WatermarkStore {
    /// Load the persisted watermark, or start from `initial` when none is stored.
    pub async fn load(
        state: Arc<dyn StateStore>,
        initial: DateTime<Utc>,
    ) -> Result<Self, PersistenceError> {
        let current = match state.get_state(WATERMARK_KEY).await? {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map_err(|e| PersistenceError::Corrupt(format!("{raw:?}: {e}")))?
                .with_timezone(&Utc),
            None => truncate_millis(initial),
        };
        debug!(watermark = %format_watermark(current), "Watermark loaded");
        Ok(Self { state, current })
    }

    pub fn current(&self) -> DateTime<Utc> {
        self.current
    }

    /// Move the watermark forward to `to` and return the value now in force.
    ///
    /// Older values are clamped to the current one. On a persistence failure
    /// the previous value stays in force and the error is returned.
    pub async fn advance(&mut self, to: DateTime<Utc>) -> Result<DateTime<Utc>, PersistenceError> {
        let to = truncate_millis(to);
        if to <= self.current {
            return Ok(self.current);
        }

        self.state
            .set_state(WATERMARK_KEY, &format_watermark(to))
            .await?;
        self.current = to;
        Ok(to)
    }
}

fn truncate_millis(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(t.timestamp_millis()).unwrap_or(t)
}

fn format_watermark(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}
