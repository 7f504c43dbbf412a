use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// A phone number leased by a user.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ServiceNumber {
    pub id: Uuid,
    pub user_id: Uuid,
    pub phone_number: String,
    pub agent_id: Option<Uuid>,
    pub is_active: bool,
}

/// Voice-AI agent configuration owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: Option<String>,
    /// Agent id on the voice-AI backend.
    pub voice_ai_agent_id: Option<String>,
    pub is_active: bool,
    pub is_default: bool,
    pub calls_schedule: Option<sqlx::types::Json<WeeklySchedule>>,
    pub schedule_timezone: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Day name (`monday` .. `sunday`) to opening hours.
pub type WeeklySchedule = HashMap<String, DaySchedule>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaySchedule {
    pub enabled: bool,
    /// `HH:MM`, inclusive.
    pub start: String,
    /// `HH:MM`, inclusive.
    pub end: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberLookupRequest {
    pub phone_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberLookupResponse {
    pub phone_number: String,
    pub national_format: Option<String>,
    pub carrier: Option<CarrierInfo>,
    /// Whether the provider recognized the number.
    pub valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarrierInfo {
    pub linetype: Option<String>,
    pub name: Option<String>,
}
