//! Call record database operations

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{CallRecord, CallStatus, Enrichment, NewCallRecord, StatusPatch};

const CALL_COLUMNS: &str = r#"
    id, user_id, agent_id, provider_call_id, voice_ai_call_id,
    direction, status, disposition, caller_number, service_number,
    created_at, started_at, ended_at, duration_seconds,
    transcript, recording_url, sentiment, call_summary,
    parent_call_id, leg_label, conference_name
"#;

pub async fn create(pool: &PgPool, new: &NewCallRecord) -> Result<CallRecord, sqlx::Error> {
    sqlx::query_as::<_, CallRecord>(&format!(
        r#"
        INSERT INTO call_records (
            user_id, agent_id, provider_call_id, direction, status,
            caller_number, service_number, parent_call_id, leg_label, conference_name,
            started_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                CASE WHEN $5 = 'in_progress'::call_status THEN NOW() END)
        RETURNING {CALL_COLUMNS}
        "#
    ))
    .bind(new.user_id)
    .bind(new.agent_id)
    .bind(&new.provider_call_id)
    .bind(&new.direction)
    .bind(&new.status)
    .bind(&new.caller_number)
    .bind(&new.service_number)
    .bind(new.parent_call_id)
    .bind(&new.leg_label)
    .bind(&new.conference_name)
    .fetch_one(pool)
    .await
}

pub async fn get_by_id(pool: &PgPool, id: Uuid) -> Result<Option<CallRecord>, sqlx::Error> {
    sqlx::query_as::<_, CallRecord>(&format!(
        "SELECT {CALL_COLUMNS} FROM call_records WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub async fn get_by_provider_call_id(
    pool: &PgPool,
    provider_call_id: &str,
) -> Result<Option<CallRecord>, sqlx::Error> {
    sqlx::query_as::<_, CallRecord>(&format!(
        "SELECT {CALL_COLUMNS} FROM call_records WHERE provider_call_id = $1"
    ))
    .bind(provider_call_id)
    .fetch_optional(pool)
    .await
}

pub async fn get_by_voice_ai_call_id(
    pool: &PgPool,
    voice_ai_call_id: &str,
) -> Result<Option<CallRecord>, sqlx::Error> {
    sqlx::query_as::<_, CallRecord>(&format!(
        r#"
        SELECT {CALL_COLUMNS} FROM call_records
        WHERE voice_ai_call_id = $1
        ORDER BY created_at DESC
        LIMIT 1
        "#
    ))
    .bind(voice_ai_call_id)
    .fetch_optional(pool)
    .await
}

/// Newest record between two numbers, in either orientation, that has not ended.
pub async fn get_open_by_participants(
    pool: &PgPool,
    first: &str,
    second: &str,
) -> Result<Option<CallRecord>, sqlx::Error> {
    sqlx::query_as::<_, CallRecord>(&format!(
        r#"
        SELECT {CALL_COLUMNS} FROM call_records
        WHERE ended_at IS NULL
          AND status NOT IN ('completed', 'busy', 'failed', 'no_answer', 'canceled')
          AND ((caller_number = $1 AND service_number = $2)
            OR (caller_number = $2 AND service_number = $1))
        ORDER BY created_at DESC
        LIMIT 1
        "#
    ))
    .bind(first)
    .bind(second)
    .fetch_optional(pool)
    .await
}

/// Newest outbound record to `destination` created after `since` that still
/// has no provider call id.
pub async fn get_recent_unlinked_outbound(
    pool: &PgPool,
    destination: &str,
    since: DateTime<Utc>,
) -> Result<Option<CallRecord>, sqlx::Error> {
    sqlx::query_as::<_, CallRecord>(&format!(
        r#"
        SELECT {CALL_COLUMNS} FROM call_records
        WHERE direction = 'outbound'
          AND provider_call_id IS NULL
          AND caller_number = $1
          AND created_at >= $2
        ORDER BY created_at DESC
        LIMIT 1
        "#
    ))
    .bind(destination)
    .bind(since)
    .fetch_optional(pool)
    .await
}

pub async fn get_transfer_leg(
    pool: &PgPool,
    parent_call_id: Uuid,
    conference_name: &str,
) -> Result<Option<CallRecord>, sqlx::Error> {
    sqlx::query_as::<_, CallRecord>(&format!(
        r#"
        SELECT {CALL_COLUMNS} FROM call_records
        WHERE parent_call_id = $1 AND conference_name = $2
        ORDER BY created_at DESC
        LIMIT 1
        "#
    ))
    .bind(parent_call_id)
    .bind(conference_name)
    .fetch_optional(pool)
    .await
}

pub async fn set_provider_call_id_if_unset(
    pool: &PgPool,
    id: Uuid,
    provider_call_id: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE call_records SET provider_call_id = $2 WHERE id = $1 AND provider_call_id IS NULL",
    )
    .bind(id)
    .bind(provider_call_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn set_voice_ai_call_id_if_unset(
    pool: &PgPool,
    id: Uuid,
    voice_ai_call_id: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE call_records SET voice_ai_call_id = $2 WHERE id = $1 AND voice_ai_call_id IS NULL",
    )
    .bind(id)
    .bind(voice_ai_call_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn set_conference(pool: &PgPool, id: Uuid, conference_name: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE call_records SET conference_name = $2 WHERE id = $1")
        .bind(id)
        .bind(conference_name)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_leg_label(pool: &PgPool, id: Uuid, leg_label: Option<&str>) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE call_records SET leg_label = $2 WHERE id = $1")
        .bind(id)
        .bind(leg_label)
        .execute(pool)
        .await?;
    Ok(())
}

/// Compare-and-set status write. Only succeeds while the row still holds
/// `expected` and has not ended.
pub async fn apply_status_patch(
    pool: &PgPool,
    id: Uuid,
    expected: &CallStatus,
    patch: &StatusPatch,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE call_records
        SET status = $3,
            started_at = COALESCE(started_at, $4),
            ended_at = COALESCE(ended_at, $5),
            duration_seconds = COALESCE($6, duration_seconds),
            disposition = COALESCE(disposition, $7)
        WHERE id = $1 AND status = $2 AND ended_at IS NULL
        "#,
    )
    .bind(id)
    .bind(expected)
    .bind(&patch.status)
    .bind(patch.started_at)
    .bind(patch.ended_at)
    .bind(patch.duration_seconds)
    .bind(&patch.disposition)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Merge post-call data. Never touches status columns.
pub async fn merge_enrichment(
    pool: &PgPool,
    id: Uuid,
    enrichment: &Enrichment,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE call_records
        SET transcript = COALESCE($2, transcript),
            recording_url = COALESCE($3, recording_url),
            sentiment = COALESCE($4, sentiment),
            call_summary = COALESCE($5, call_summary),
            voice_ai_call_id = COALESCE(voice_ai_call_id, $6)
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(&enrichment.transcript)
    .bind(&enrichment.recording_url)
    .bind(&enrichment.sentiment)
    .bind(&enrichment.call_summary)
    .bind(&enrichment.voice_ai_call_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}
