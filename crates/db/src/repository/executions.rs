//! Execution repository functions.
//!
//! Executions are written as whole snapshots: every state change upserts the
//! row, which keeps per-step updates a single point write keyed by id.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::{
    models::{ExecutionListRow, ExecutionRow},
    repository::{clamp_limit, decode_cursor, paginate},
    DbError, Page,
};

const EXECUTION_COLUMNS: &str = "id, workflow_id, workflow_version, status, priority, snapshot, \
     created_at, started_at, finished_at, updated_at";

/// Insert or overwrite an execution snapshot.
pub async fn upsert_execution(pool: &SqlitePool, row: &ExecutionRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO executions
            (id, workflow_id, workflow_version, status, priority, snapshot,
             created_at, started_at, finished_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (id) DO UPDATE SET
            status      = excluded.status,
            snapshot    = excluded.snapshot,
            started_at  = excluded.started_at,
            finished_at = excluded.finished_at,
            updated_at  = excluded.updated_at
        "#,
    )
    .bind(&row.id)
    .bind(&row.workflow_id)
    .bind(row.workflow_version)
    .bind(&row.status)
    .bind(row.priority)
    .bind(&row.snapshot)
    .bind(row.created_at)
    .bind(row.started_at)
    .bind(row.finished_at)
    .bind(row.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Point lookup by execution id.
pub async fn get_execution(pool: &SqlitePool, id: &str) -> Result<ExecutionRow, DbError> {
    let sql = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?");
    sqlx::query_as::<_, ExecutionRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

/// Number of executions of `workflow_id` that have not reached a terminal
/// status.
pub async fn count_active_for_workflow(pool: &SqlitePool, workflow_id: &str) -> Result<i64, DbError> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM executions
        WHERE workflow_id = ? AND status IN ('pending', 'running')
        "#,
    )
    .bind(workflow_id)
    .fetch_one(pool)
    .await?;

    Ok(count)
}

/// Page through the executions of one workflow, oldest first.
pub async fn list_executions_for_workflow(
    pool: &SqlitePool,
    workflow_id: &str,
    cursor: Option<&str>,
    limit: i64,
) -> Result<Page<ExecutionRow>, DbError> {
    let after = decode_cursor(cursor)?;
    let limit = clamp_limit(limit);

    let sql = format!(
        "SELECT seq, {EXECUTION_COLUMNS} FROM executions \
         WHERE workflow_id = ? AND seq > ? ORDER BY seq ASC LIMIT ?"
    );
    let rows = sqlx::query_as::<_, ExecutionListRow>(&sql)
        .bind(workflow_id)
        .bind(after)
        .bind(limit + 1)
        .fetch_all(pool)
        .await?;

    Ok(paginate(rows, limit, |r| r.seq).map(|r| r.row))
}

/// Executions created at or after `since`, optionally for one workflow.
/// Used by the metrics surface, never by the scheduler.
pub async fn list_executions_since(
    pool: &SqlitePool,
    since: Option<DateTime<Utc>>,
    workflow_id: Option<&str>,
) -> Result<Vec<ExecutionRow>, DbError> {
    let sql = format!(
        "SELECT {EXECUTION_COLUMNS} FROM executions \
         WHERE (? IS NULL OR created_at >= ?) AND (? IS NULL OR workflow_id = ?) \
         ORDER BY seq ASC"
    );
    let rows = sqlx::query_as::<_, ExecutionRow>(&sql)
        .bind(since)
        .bind(since)
        .bind(workflow_id)
        .bind(workflow_id)
        .fetch_all(pool)
        .await?;

    Ok(rows)
}
