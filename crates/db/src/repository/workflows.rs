//! Workflow catalog operations.
//!
//! A workflow is a catalog row (`workflows`) plus one or more immutable
//! revisions (`workflow_versions`). New revisions are appended; existing
//! ones are never rewritten.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::{
    models::{NewWorkflowVersion, WorkflowRecord, WorkflowStatus, WorkflowVersionRow},
    repository::{clamp_limit, decode_cursor, paginate},
    DbError, Page,
};

const SELECT_RECORD: &str = r#"
    SELECT w.seq, w.id, w.latest_version, w.status, v.definition,
           w.created_at, w.updated_at, w.deleted_at
    FROM workflows w
    JOIN workflow_versions v
      ON v.workflow_id = w.id AND v.version = w.latest_version
"#;

/// Insert a new workflow together with its first revision.
pub async fn create_workflow(
    pool: &SqlitePool,
    new: &NewWorkflowVersion<'_>,
) -> Result<WorkflowRecord, DbError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO workflows
            (id, name, description, tags, latest_version, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 'active', ?, ?)
        "#,
    )
    .bind(new.id)
    .bind(new.name)
    .bind(new.description)
    .bind(&new.tags)
    .bind(new.version)
    .bind(new.created_at)
    .bind(new.created_at)
    .execute(&mut *tx)
    .await?;

    insert_version(&mut tx, new).await?;
    tx.commit().await?;

    get_workflow(pool, new.id).await
}

/// Append a revision on top of `base_version`.
///
/// Fails with [`DbError::Conflict`] when the workflow moved past
/// `base_version` in the meantime and with [`DbError::NotFound`] when it is
/// missing or deleted.
pub async fn append_version(
    pool: &SqlitePool,
    base_version: i64,
    new: &NewWorkflowVersion<'_>,
) -> Result<WorkflowRecord, DbError> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        r#"
        UPDATE workflows
        SET name = ?, description = ?, tags = ?, latest_version = ?, updated_at = ?
        WHERE id = ? AND latest_version = ? AND status = 'active'
        "#,
    )
    .bind(new.name)
    .bind(new.description)
    .bind(&new.tags)
    .bind(new.version)
    .bind(new.created_at)
    .bind(new.id)
    .bind(base_version)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 0 {
        tx.rollback().await?;
        let current = get_workflow(pool, new.id).await?;
        if current.status != WorkflowStatus::Active.to_string() {
            return Err(DbError::NotFound);
        }
        return Err(DbError::Conflict(format!(
            "workflow {} is at version {}, expected {}",
            new.id, current.latest_version, base_version
        )));
    }

    insert_version(&mut tx, new).await?;
    tx.commit().await?;

    get_workflow(pool, new.id).await
}

async fn insert_version(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    new: &NewWorkflowVersion<'_>,
) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO workflow_versions (workflow_id, version, definition, created_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(new.id)
    .bind(new.version)
    .bind(&new.definition)
    .bind(new.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Fetch a workflow (latest revision) by id, whatever its status.
pub async fn get_workflow(pool: &SqlitePool, id: &str) -> Result<WorkflowRecord, DbError> {
    let sql = format!("{SELECT_RECORD} WHERE w.id = ?");
    sqlx::query_as::<_, WorkflowRecord>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

/// Fetch one specific revision.
pub async fn get_workflow_version(
    pool: &SqlitePool,
    id: &str,
    version: i64,
) -> Result<WorkflowVersionRow, DbError> {
    sqlx::query_as::<_, WorkflowVersionRow>(
        r#"
        SELECT workflow_id, version, definition, created_at
        FROM workflow_versions
        WHERE workflow_id = ? AND version = ?
        "#,
    )
    .bind(id)
    .bind(version)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}

/// List workflows in insertion order, optionally filtered by tag.
pub async fn list_workflows(
    pool: &SqlitePool,
    tag: Option<&str>,
    status: WorkflowStatus,
    cursor: Option<&str>,
    limit: i64,
) -> Result<Page<WorkflowRecord>, DbError> {
    let after = decode_cursor(cursor)?;
    let limit = clamp_limit(limit);

    let sql = format!(
        r#"{SELECT_RECORD}
        WHERE w.status = ?
          AND w.seq > ?
          AND (? IS NULL OR EXISTS (SELECT 1 FROM json_each(w.tags) t WHERE t.value = ?))
        ORDER BY w.seq ASC
        LIMIT ?"#
    );

    let rows = sqlx::query_as::<_, WorkflowRecord>(&sql)
        .bind(status.to_string())
        .bind(after)
        .bind(tag)
        .bind(tag)
        .bind(limit + 1)
        .fetch_all(pool)
        .await?;

    Ok(paginate(rows, limit, |r| r.seq))
}

/// Tombstone a live workflow. Revisions are kept for executions that still
/// reference them.
///
/// Returns `DbError::NotFound` if no live row was updated.
pub async fn soft_delete_workflow(
    pool: &SqlitePool,
    id: &str,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE workflows
        SET status = 'deleted', deleted_at = ?, updated_at = ?
        WHERE id = ? AND status = 'active'
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}
