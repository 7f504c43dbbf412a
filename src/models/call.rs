use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One logical call. Legs the system creates for transfers get their own
/// record linked back through `parent_call_id`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    pub provider_call_id: Option<String>,
    pub voice_ai_call_id: Option<String>,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub disposition: Option<String>,
    pub caller_number: String,
    pub service_number: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
    pub transcript: Option<String>,
    pub recording_url: Option<String>,
    pub sentiment: Option<String>,
    pub call_summary: Option<String>,
    pub parent_call_id: Option<Uuid>,
    pub leg_label: Option<String>,
    pub conference_name: Option<String>,
}

impl CallRecord {
    /// Snapshot of the fields the transition function reasons about.
    pub fn leg_state(&self) -> LegState {
        LegState {
            direction: self.direction.clone(),
            status: self.status.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.ended_at.is_some() || self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "call_direction", rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Inbound => "inbound",
            CallDirection::Outbound => "outbound",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "call_status", rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    InProgress,
    Completed,
    Busy,
    Failed,
    NoAnswer,
    Canceled,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::InProgress => "in_progress",
            CallStatus::Completed => "completed",
            CallStatus::Busy => "busy",
            CallStatus::Failed => "failed",
            CallStatus::NoAnswer => "no_answer",
            CallStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Completed
                | CallStatus::Busy
                | CallStatus::Failed
                | CallStatus::NoAnswer
                | CallStatus::Canceled
        )
    }

    /// Position in the forward-only lifecycle. All terminal statuses share
    /// the top rank.
    pub fn rank(&self) -> u8 {
        match self {
            CallStatus::Initiated => 0,
            CallStatus::Ringing => 1,
            CallStatus::InProgress => 2,
            _ => 3,
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields of a record that status transitions read.
#[derive(Debug, Clone, PartialEq)]
pub struct LegState {
    pub direction: CallDirection,
    pub status: CallStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A status observation after provider vocabulary has been mapped.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: CallStatus,
    pub duration_seconds: Option<i32>,
    pub observed_at: DateTime<Utc>,
}

/// Column changes produced by an accepted transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusPatch {
    pub status: CallStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
    pub disposition: Option<String>,
}

/// Values needed to insert a fresh record.
#[derive(Debug, Clone)]
pub struct NewCallRecord {
    pub user_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    pub provider_call_id: Option<String>,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub caller_number: String,
    pub service_number: String,
    pub parent_call_id: Option<Uuid>,
    pub leg_label: Option<String>,
    pub conference_name: Option<String>,
}

impl NewCallRecord {
    pub fn inbound(caller_number: &str, service_number: &str, provider_call_id: &str) -> Self {
        Self {
            user_id: None,
            agent_id: None,
            provider_call_id: Some(provider_call_id.to_string()),
            direction: CallDirection::Inbound,
            status: CallStatus::InProgress,
            caller_number: caller_number.to_string(),
            service_number: service_number.to_string(),
            parent_call_id: None,
            leg_label: None,
            conference_name: None,
        }
    }

    pub fn outbound(destination: &str, caller_id: &str) -> Self {
        Self {
            user_id: None,
            agent_id: None,
            provider_call_id: None,
            direction: CallDirection::Outbound,
            status: CallStatus::Initiated,
            caller_number: destination.to_string(),
            service_number: caller_id.to_string(),
            parent_call_id: None,
            leg_label: None,
            conference_name: None,
        }
    }
}

/// Out-of-band data delivered after the call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub transcript: Option<String>,
    pub recording_url: Option<String>,
    pub sentiment: Option<String>,
    pub call_summary: Option<String>,
    pub voice_ai_call_id: Option<String>,
}

/// How an outbound call reaches its destination.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutboundMode {
    /// Voice-AI agent leg first, then the bridging document dials the destination.
    #[default]
    Agent,
    /// User's own phone first, then the bridging document dials the destination.
    Callback,
    /// Agent leg and PSTN leg dialed separately into one conference.
    Conference,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateCallRequest {
    pub to: String,
    pub from: Option<String>,
    #[serde(default)]
    pub mode: OutboundMode,
    /// Required for `callback` mode: the user's own phone.
    pub callback_number: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateCallResponse {
    pub call_record_id: Uuid,
    pub provider_call_id: String,
    pub status: CallStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub target_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    pub conference: String,
    pub transferee_record_id: Uuid,
    pub transferee_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferLegRequest {
    pub conference: String,
}
