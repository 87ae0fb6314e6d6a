//! Batch queue storage
//!
//! FIFO work queue backing the batch runner. Each row is one unit of
//! deferred work: an operation name plus an opaque JSON payload.

use chrono::Utc;
use crmgate_common::{Error, Result};
use sqlx::{Row, SqlitePool};

/// One queued work item
#[derive(Debug, Clone)]
pub struct BatchTask {
    pub id: i64,
    pub operation: String,
    pub payload: serde_json::Value,
    pub attempts: i64,
}

/// Append a task to the queue
pub async fn enqueue(
    db: &SqlitePool,
    operation: &str,
    payload: &serde_json::Value,
) -> Result<()> {
    sqlx::query("INSERT INTO batch_queue (operation, payload, created_at) VALUES (?, ?, ?)")
        .bind(operation)
        .bind(payload.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(db)
        .await
        .map_err(Error::Database)?;

    Ok(())
}

/// Fetch the oldest queued task, if any
pub async fn next_task(db: &SqlitePool) -> Result<Option<BatchTask>> {
    let row = sqlx::query(
        "SELECT id, operation, payload, attempts FROM batch_queue ORDER BY id LIMIT 1",
    )
    .fetch_optional(db)
    .await
    .map_err(Error::Database)?;

    let row = match row {
        Some(row) => row,
        None => return Ok(None),
    };

    let payload: String = row.try_get("payload").map_err(Error::Database)?;

    Ok(Some(BatchTask {
        id: row.try_get("id").map_err(Error::Database)?,
        operation: row.try_get("operation").map_err(Error::Database)?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| Error::Internal(format!("Corrupt payload column: {}", e)))?,
        attempts: row.try_get("attempts").map_err(Error::Database)?,
    }))
}

/// Record a failed attempt on a task
pub async fn bump_attempts(db: &SqlitePool, task_id: i64) -> Result<()> {
    sqlx::query("UPDATE batch_queue SET attempts = attempts + 1 WHERE id = ?")
        .bind(task_id)
        .execute(db)
        .await
        .map_err(Error::Database)?;

    Ok(())
}

/// Remove a completed (or exhausted) task
pub async fn delete_task(db: &SqlitePool, task_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM batch_queue WHERE id = ?")
        .bind(task_id)
        .execute(db)
        .await
        .map_err(Error::Database)?;

    Ok(())
}

/// Remaining queue length
pub async fn remaining_count(db: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM batch_queue")
        .fetch_one(db)
        .await
        .map_err(Error::Database)?;

    Ok(count)
}

/// Clear the queue entirely; returns the number of discarded items
pub async fn clear_all(db: &SqlitePool) -> Result<i64> {
    let result = sqlx::query("DELETE FROM batch_queue")
        .execute(db)
        .await
        .map_err(Error::Database)?;

    Ok(result.rows_affected() as i64)
}
