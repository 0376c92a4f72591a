//! Task checkpoint operations.

use crate::types::{TaskId, TaskSnapshot};
use crate::{Error, Result};
use tracing::warn;

use super::{Database, TaskRow};

impl Database {
    /// Write a task checkpoint
    ///
    /// Older revisions never overwrite newer ones, so checkpoints written out
    /// of order by concurrent workers converge on the latest state.
    pub async fn checkpoint_task(&self, snapshot: &TaskSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        sqlx::query(
            r#"
            INSERT INTO tasks (id, revision, state, priority, created_at, snapshot)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                revision = excluded.revision,
                state = excluded.state,
                priority = excluded.priority,
                snapshot = excluded.snapshot
            WHERE excluded.revision > tasks.revision
            "#,
        )
        .bind(snapshot.id.0)
        .bind(snapshot.revision as i64)
        .bind(snapshot.state.to_i32())
        .bind(snapshot.priority.0)
        .bind(snapshot.created_at.timestamp_millis())
        .bind(json)
        .execute(&self.pool)
        .await
        .map_err(Error::Sqlx)?;
        Ok(())
    }

    /// Drop a task checkpoint
    pub async fn delete_task(&self, id: TaskId) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(Error::Sqlx)?;
        Ok(())
    }

    /// Load all checkpoints in admission order
    ///
    /// Checkpoints of tasks already recorded in history are dropped first.
    /// Rows that no longer decode are skipped with a warning.
    pub async fn load_tasks(&self) -> Result<Vec<TaskSnapshot>> {
        sqlx::query("DELETE FROM tasks WHERE id IN (SELECT id FROM history)")
            .execute(&self.pool)
            .await
            .map_err(Error::Sqlx)?;

        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT id, revision, snapshot FROM tasks ORDER BY priority ASC, created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Sqlx)?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match TaskSnapshot::try_from(row) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable task checkpoint");
                    None
                }
            })
            .collect())
    }

    /// Highest task id ever stored, in either table
    pub async fn max_task_id(&self) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(id) FROM (SELECT id FROM tasks UNION ALL SELECT id FROM history)",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Sqlx)?;
        Ok(max.unwrap_or(0))
    }
}
