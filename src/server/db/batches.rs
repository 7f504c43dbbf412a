//! Batch call database operations

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{BatchCall, BatchRecipient, RecipientStatus};

const BATCH_COLUMNS: &str = r#"
    id, user_id, name, caller_id, status, max_concurrency, scheduled_at,
    total_recipients, completed_count, failed_count, started_at, completed_at
"#;

const RECIPIENT_COLUMNS: &str = r#"
    id, batch_id, phone_number, name, status, call_record_id,
    error_message, sort_order, attempted_at, completed_at
"#;

pub async fn get_by_id(pool: &PgPool, id: Uuid) -> Result<Option<BatchCall>, sqlx::Error> {
    sqlx::query_as::<_, BatchCall>(&format!("SELECT {BATCH_COLUMNS} FROM batch_calls WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Move scheduled batches whose start time has passed to running.
pub async fn promote_due(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<Uuid>, sqlx::Error> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        UPDATE batch_calls
        SET status = 'running', started_at = COALESCE(started_at, $1)
        WHERE status = 'scheduled' AND scheduled_at IS NOT NULL AND scheduled_at <= $1
        RETURNING id
        "#,
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn running_ids(pool: &PgPool) -> Result<Vec<Uuid>, sqlx::Error> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT id FROM batch_calls WHERE status = 'running' ORDER BY started_at")
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn count_recipients(
    pool: &PgPool,
    batch_id: Uuid,
    status: &RecipientStatus,
) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM batch_call_recipients WHERE batch_id = $1 AND status = $2",
    )
    .bind(batch_id)
    .bind(status)
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

/// Atomically move up to `limit` pending recipients to calling.
pub async fn claim_pending(
    pool: &PgPool,
    batch_id: Uuid,
    limit: i64,
) -> Result<Vec<BatchRecipient>, sqlx::Error> {
    let mut claimed = sqlx::query_as::<_, BatchRecipient>(&format!(
        r#"
        UPDATE batch_call_recipients
        SET status = 'calling', attempted_at = NOW()
        WHERE id IN (
            SELECT id FROM batch_call_recipients
            WHERE batch_id = $1 AND status = 'pending'
            ORDER BY sort_order
            LIMIT $2
            FOR UPDATE SKIP LOCKED
        )
        RETURNING {RECIPIENT_COLUMNS}
        "#
    ))
    .bind(batch_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    claimed.sort_by_key(|r| r.sort_order);
    Ok(claimed)
}

pub async fn link_call_record(
    pool: &PgPool,
    recipient_id: Uuid,
    call_record_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE batch_call_recipients SET call_record_id = $2 WHERE id = $1")
        .bind(recipient_id)
        .bind(call_record_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Finish a calling recipient and bump the batch counter in one statement.
/// Returns the batch id when this call made the change.
async fn finish_where(
    pool: &PgPool,
    filter: &str,
    key: Uuid,
    success: bool,
    message: Option<&str>,
) -> Result<Option<Uuid>, sqlx::Error> {
    let (status, counter) = if success {
        ("completed", "completed_count")
    } else {
        ("failed", "failed_count")
    };
    let row: Option<(Uuid,)> = sqlx::query_as(&format!(
        r#"
        WITH finished AS (
            UPDATE batch_call_recipients
            SET status = '{status}', error_message = $2, completed_at = NOW()
            WHERE {filter} = $1 AND status = 'calling'
            RETURNING batch_id
        )
        UPDATE batch_calls
        SET {counter} = {counter} + 1
        FROM finished
        WHERE batch_calls.id = finished.batch_id
        RETURNING batch_calls.id
        "#
    ))
    .bind(key)
    .bind(message)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(id,)| id))
}

pub async fn fail_recipient(
    pool: &PgPool,
    recipient_id: Uuid,
    message: &str,
) -> Result<Option<Uuid>, sqlx::Error> {
    finish_where(pool, "id", recipient_id, false, Some(message)).await
}

pub async fn finish_recipient_for_call(
    pool: &PgPool,
    call_record_id: Uuid,
    success: bool,
    message: Option<&str>,
) -> Result<Option<Uuid>, sqlx::Error> {
    finish_where(pool, "call_record_id", call_record_id, success, message).await
}

pub async fn complete_if_drained(pool: &PgPool, batch_id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE batch_calls
        SET status = 'completed', completed_at = NOW()
        WHERE id = $1
          AND status = 'running'
          AND NOT EXISTS (
              SELECT 1 FROM batch_call_recipients
              WHERE batch_id = $1 AND status IN ('pending', 'calling')
          )
        "#,
    )
    .bind(batch_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}
