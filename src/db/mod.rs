//! Checkpoint store
//!
//! SQLite persistence for live task checkpoints and finished-task history.
//! Everything here is best-effort: the engine keeps running when a write
//! fails and replays whatever it finds at the next start.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`]: opening the store and schema migrations
//! - [`tasks`]: task checkpoints, upserted per transition and dropped on terminal
//! - [`history`]: terminal task records

use crate::error::DatabaseError;
use crate::types::{HistoryEntry, TaskSnapshot};
use serde::de::DeserializeOwned;
use sqlx::{FromRow, sqlite::SqlitePool};

mod history;
mod migrations;
mod tasks;

/// Checkpoint row from database
#[derive(Debug, Clone, FromRow)]
pub(crate) struct TaskRow {
    /// Task id
    pub id: i64,
    /// Registry revision the checkpoint was taken at
    pub revision: i64,
    /// JSON-encoded [`TaskSnapshot`]
    pub snapshot: String,
}

/// History row from database
#[derive(Debug, Clone, FromRow)]
pub(crate) struct HistoryRow {
    /// Task id
    pub id: i64,
    /// JSON-encoded [`HistoryEntry`]
    pub entry: String,
}

fn decode<T: DeserializeOwned>(id: i64, json: &str) -> std::result::Result<T, DatabaseError> {
    serde_json::from_str(json).map_err(|e| DatabaseError::CorruptRecord {
        id,
        reason: e.to_string(),
    })
}

impl TryFrom<TaskRow> for TaskSnapshot {
    type Error = DatabaseError;

    fn try_from(row: TaskRow) -> std::result::Result<Self, Self::Error> {
        let mut snapshot: TaskSnapshot = decode(row.id, &row.snapshot)?;
        snapshot.revision = row.revision as u64;
        Ok(snapshot)
    }
}

impl TryFrom<HistoryRow> for HistoryEntry {
    type Error = DatabaseError;

    fn try_from(row: HistoryRow) -> std::result::Result<Self, Self::Error> {
        decode(row.id, &row.entry)
    }
}

/// Database handle for the checkpoint store
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
