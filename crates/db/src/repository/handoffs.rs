//! Handoff catalog operations.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::{
    models::HandoffRow,
    repository::{clamp_limit, decode_cursor, paginate},
    DbError, Page,
};

/// Insert a handoff definition. `definition` is the full JSON document.
pub async fn insert_handoff(
    pool: &SqlitePool,
    id: &str,
    source_agent_id: &str,
    target_agent_id: &str,
    definition: &str,
    created_at: DateTime<Utc>,
) -> Result<HandoffRow, DbError> {
    sqlx::query(
        r#"
        INSERT INTO handoffs (id, source_agent_id, target_agent_id, definition, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(source_agent_id)
    .bind(target_agent_id)
    .bind(definition)
    .bind(created_at)
    .execute(pool)
    .await?;

    get_handoff(pool, id).await
}

pub async fn get_handoff(pool: &SqlitePool, id: &str) -> Result<HandoffRow, DbError> {
    sqlx::query_as::<_, HandoffRow>(
        r#"
        SELECT seq, id, source_agent_id, target_agent_id, definition, created_at
        FROM handoffs WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}

/// Page through handoffs in registration order, optionally for one source
/// agent.
pub async fn list_handoffs(
    pool: &SqlitePool,
    source_agent_id: Option<&str>,
    cursor: Option<&str>,
    limit: i64,
) -> Result<Page<HandoffRow>, DbError> {
    let after = decode_cursor(cursor)?;
    let limit = clamp_limit(limit);

    let rows = sqlx::query_as::<_, HandoffRow>(
        r#"
        SELECT seq, id, source_agent_id, target_agent_id, definition, created_at
        FROM handoffs
        WHERE seq > ? AND (? IS NULL OR source_agent_id = ?)
        ORDER BY seq ASC
        LIMIT ?
        "#,
    )
    .bind(after)
    .bind(source_agent_id)
    .bind(source_agent_id)
    .bind(limit + 1)
    .fetch_all(pool)
    .await?;

    Ok(paginate(rows, limit, |r| r.seq))
}

/// Every handoff whose source is `agent_id`, in registration order.
pub async fn handoffs_for_source(pool: &SqlitePool, agent_id: &str) -> Result<Vec<HandoffRow>, DbError> {
    let rows = sqlx::query_as::<_, HandoffRow>(
        r#"
        SELECT seq, id, source_agent_id, target_agent_id, definition, created_at
        FROM handoffs WHERE source_agent_id = ?
        ORDER BY seq ASC
        "#,
    )
    .bind(agent_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::migrated_memory_pool;

    #[tokio::test]
    async fn source_lookup_preserves_registration_order() {
        let pool = migrated_memory_pool().await.unwrap();
        let now = Utc::now();
        insert_handoff(&pool, "h1", "writer", "reviewer", "{}", now).await.unwrap();
        insert_handoff(&pool, "h2", "other", "reviewer", "{}", now).await.unwrap();
        insert_handoff(&pool, "h3", "writer", "publisher", "{}", now).await.unwrap();

        let ids: Vec<String> = handoffs_for_source(&pool, "writer")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["h1", "h3"]);

        let page = list_handoffs(&pool, None, None, 2).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.next_cursor.is_some());
    }
}
