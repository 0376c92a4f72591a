//! History persistence.

use crate::types::HistoryEntry;
use crate::{Error, Result};
use tracing::warn;

use super::{Database, HistoryRow};

impl Database {
    /// Record a finished task
    ///
    /// A task is recorded at most once; repeated inserts for the same id are
    /// ignored.
    pub async fn insert_history(&self, entry: &HistoryEntry) -> Result<()> {
        let json = serde_json::to_string(entry)?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO history (id, state, owner, completed_at, entry)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id.0)
        .bind(entry.state.to_i32())
        .bind(&entry.owner)
        .bind(entry.completed_at.timestamp_millis())
        .bind(json)
        .execute(&self.pool)
        .await
        .map_err(Error::Sqlx)?;
        Ok(())
    }

    /// Most recent `limit` entries, oldest first
    pub async fn recent_history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT id, entry FROM (
                SELECT id, entry, completed_at FROM history
                ORDER BY completed_at DESC, id DESC
                LIMIT ?
            )
            ORDER BY completed_at ASC, id ASC
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Sqlx)?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match HistoryEntry::try_from(row) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable history record");
                    None
                }
            })
            .collect())
    }

    /// Count stored history entries
    #[cfg(test)]
    pub(crate) async fn count_history(&self) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM history")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Sqlx)
    }

    /// Delete all but the newest `keep` entries
    ///
    /// The highest id is always kept so [`Database::max_task_id`] stays
    /// accurate. Returns the number of rows removed.
    pub async fn prune_history(&self, keep: usize) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM history WHERE id NOT IN (
                SELECT id FROM history ORDER BY completed_at DESC, id DESC LIMIT ?
            ) AND id < (SELECT MAX(id) FROM history)
            "#,
        )
        .bind(keep as i64)
        .execute(&self.pool)
        .await
        .map_err(Error::Sqlx)?;
        Ok(result.rows_affected())
    }
}
