//! libSQL backend for process state and the item-failure log.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{FailureLog, ItemFailure, StateStore};

/// libSQL database backend.
///
/// Holds a single connection reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

const FAILURE_COLUMNS: &str = "id, batch_id, item_id, sender, subject, stage, reason, failed_at";

fn row_to_failure(row: &libsql::Row) -> Result<ItemFailure, libsql::Error> {
    let id: String = row.get(0)?;
    let batch_id: String = row.get(1)?;
    let failed_at: String = row.get(7)?;
    Ok(ItemFailure {
        id: parse_uuid(&id),
        batch_id: parse_uuid(&batch_id),
        item_id: row.get(2)?,
        sender: row.get(3)?,
        subject: row.get(4)?,
        stage: row.get(5)?,
        reason: row.get(6)?,
        failed_at: parse_datetime(&failed_at),
    })
}

// ── Trait implementations ───────────────────────────────────────────

#[async_trait]
impl StateStore for LibSqlBackend {
    async fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT value FROM state WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_state: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<String>(0)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_state: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_state: {e}"))),
        }
    }

    async fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO state (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO UPDATE SET value = ?2, updated_at = ?3",
                params![key, value, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_state: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl FailureLog for LibSqlBackend {
    async fn record_item_failure(&self, failure: &ItemFailure) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO item_failures ({FAILURE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    failure.id.to_string(),
                    failure.batch_id.to_string(),
                    failure.item_id.as_str(),
                    failure.sender.as_str(),
                    failure.subject.as_str(),
                    failure.stage.as_str(),
                    failure.reason.as_str(),
                    failure.failed_at.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_item_failure: {e}")))?;
        Ok(())
    }

    async fn recent_item_failures(&self, limit: usize) -> Result<Vec<ItemFailure>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {FAILURE_COLUMNS} FROM item_failures ORDER BY failed_at DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_item_failures: {e}")))?;

        let mut failures = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_failure(&row) {
                Ok(failure) => failures.push(failure),
                Err(e) => warn!("Skipping item_failures row: {e}"),
            }
        }
        Ok(failures)
    }
}
