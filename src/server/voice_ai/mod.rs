//! Voice-AI backend client
//!
//! Registers inbound calls before they are bridged over SIP and fetches
//! call detail once the backend reports a call ended.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::server::config::VoiceAiConfig;

#[derive(Error, Debug)]
pub enum VoiceAiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterCallRequest {
    pub agent_id: String,
    pub from_number: String,
    pub to_number: String,
    pub direction: String,
    /// Routing metadata echoed back on the call detail.
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct RegisterCallResponse {
    call_id: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CallDetail {
    pub call_id: String,
    #[serde(default)]
    pub from_number: Option<String>,
    #[serde(default)]
    pub to_number: Option<String>,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub transcript_object: Vec<TranscriptTurn>,
    #[serde(default)]
    pub recording_url: Option<String>,
    #[serde(default)]
    pub call_analysis: Option<CallAnalysis>,
    /// Epoch milliseconds.
    #[serde(default)]
    pub start_timestamp: Option<i64>,
    /// Epoch milliseconds.
    #[serde(default)]
    pub end_timestamp: Option<i64>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TranscriptTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CallAnalysis {
    #[serde(default)]
    pub call_summary: Option<String>,
    #[serde(default)]
    pub user_sentiment: Option<String>,
}

impl CallDetail {
    /// Plain transcript, else the turns formatted one per line.
    pub fn transcript_text(&self) -> Option<String> {
        if let Some(text) = self.transcript.as_deref().filter(|t| !t.trim().is_empty()) {
            return Some(text.to_string());
        }
        if self.transcript_object.is_empty() {
            return None;
        }
        let lines: Vec<String> = self
            .transcript_object
            .iter()
            .map(|turn| {
                let speaker = if turn.role.eq_ignore_ascii_case("agent") { "Agent" } else { "Caller" };
                format!("{}: {}", speaker, turn.content)
            })
            .collect();
        Some(lines.join("\n"))
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.end_timestamp.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }

    /// Whole seconds between the start and end timestamps.
    pub fn duration_seconds(&self) -> Option<i32> {
        match (self.start_timestamp, self.end_timestamp) {
            (Some(start), Some(end)) if end >= start => Some(((end - start) / 1000) as i32),
            _ => None,
        }
    }

    /// `call_record_id` stored in the metadata at registration.
    pub fn call_record_id(&self) -> Option<uuid::Uuid> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("call_record_id"))
            .and_then(|v| v.as_str())
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
    }
}

/// Webhook body posted by the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceAiWebhook {
    pub event: String,
    pub call: WebhookCall,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookCall {
    pub call_id: String,
    #[serde(default)]
    pub from_number: Option<String>,
    #[serde(default)]
    pub to_number: Option<String>,
}

#[async_trait]
pub trait VoiceAiBackend: Send + Sync {
    /// Returns the backend's call id.
    async fn register_phone_call(&self, request: &RegisterCallRequest) -> Result<String, VoiceAiError>;
    async fn get_call(&self, call_id: &str) -> Result<CallDetail, VoiceAiError>;
}

#[derive(Clone)]
pub struct VoiceAiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl VoiceAiClient {
    pub fn new(config: &VoiceAiConfig) -> Self {
        Self {
            client: Client::new(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn read<R: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<R, VoiceAiError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(VoiceAiError::Api { status: status.as_u16(), message });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl VoiceAiBackend for VoiceAiClient {
    async fn register_phone_call(&self, request: &RegisterCallRequest) -> Result<String, VoiceAiError> {
        let response = self
            .client
            .post(format!("{}/v2/register-phone-call", self.base_url))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;
        let registered: RegisterCallResponse = Self::read(response).await?;
        Ok(registered.call_id)
    }

    async fn get_call(&self, call_id: &str) -> Result<CallDetail, VoiceAiError> {
        let response = self
            .client
            .get(format!("{}/v2/get-call/{}", self.base_url, call_id))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Self::read(response).await
    }
}
