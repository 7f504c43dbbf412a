//! Leased number and agent lookups

use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{AgentConfig, ServiceNumber};

const AGENT_COLUMNS: &str = r#"
    id, user_id, name, voice_ai_agent_id, is_active, is_default,
    calls_schedule, schedule_timezone, created_at
"#;

pub async fn get_active_number(
    pool: &PgPool,
    phone_number: &str,
) -> Result<Option<ServiceNumber>, sqlx::Error> {
    sqlx::query_as::<_, ServiceNumber>(
        r#"
        SELECT id, user_id, phone_number, agent_id, is_active
        FROM service_numbers
        WHERE phone_number = $1 AND is_active
        LIMIT 1
        "#,
    )
    .bind(phone_number)
    .fetch_optional(pool)
    .await
}

pub async fn user_has_active_number(
    pool: &PgPool,
    user_id: Uuid,
    phone_number: &str,
) -> Result<bool, sqlx::Error> {
    let row: (bool,) = sqlx::query_as(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM service_numbers
            WHERE user_id = $1 AND phone_number = $2 AND is_active
        )
        "#,
    )
    .bind(user_id)
    .bind(phone_number)
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

pub async fn get_agent(pool: &PgPool, id: Uuid) -> Result<Option<AgentConfig>, sqlx::Error> {
    sqlx::query_as::<_, AgentConfig>(&format!(
        "SELECT {AGENT_COLUMNS} FROM agent_configs WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// The user's default agent, else their oldest one.
pub async fn get_fallback_agent(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Option<AgentConfig>, sqlx::Error> {
    sqlx::query_as::<_, AgentConfig>(&format!(
        r#"
        SELECT {AGENT_COLUMNS} FROM agent_configs
        WHERE user_id = $1
        ORDER BY is_default DESC, created_at ASC
        LIMIT 1
        "#
    ))
    .bind(user_id)
    .fetch_optional(pool)
    .await
}
