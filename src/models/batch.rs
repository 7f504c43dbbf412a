use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BatchCall {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub caller_id: String,
    pub status: BatchStatus,
    pub max_concurrency: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub total_recipients: i32,
    pub completed_count: i32,
    pub failed_count: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "batch_status", rename_all = "snake_case")]
pub enum BatchStatus {
    Draft,
    Scheduled,
    Running,
    Completed,
    Canceled,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecipient {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub phone_number: String,
    pub name: Option<String>,
    pub status: RecipientStatus,
    pub call_record_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub sort_order: i32,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "recipient_status", rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Calling,
    Completed,
    Failed,
}

impl RecipientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientStatus::Pending => "pending",
            RecipientStatus::Calling => "calling",
            RecipientStatus::Completed => "completed",
            RecipientStatus::Failed => "failed",
        }
    }
}

/// Outcome of one dispatch pass over a batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSummary {
    pub initiated: u32,
    pub failed: u32,
    pub remaining: i64,
    pub batch_completed: bool,
    pub message: String,
}
