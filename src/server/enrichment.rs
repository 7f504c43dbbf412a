//! Post-call enrichment from the voice-AI backend
//!
//! The backend announces a finished call by webhook; the full call detail
//! is fetched and merged onto the matching record. Enrichment never
//! changes a terminal status; it only finalizes records the provider
//! callbacks left open.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};

use crate::models::{CallRecord, CallStatus, Enrichment, StatusUpdate};
use crate::server::{
    correlator,
    db::StoreResult,
    voice_ai::{CallDetail, VoiceAiWebhook},
    AppState,
};

const CALL_ENDED: &str = "call_ended";

/// POST /webhooks/voice-ai
pub async fn handle_voice_ai_webhook(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VoiceAiWebhook>, JsonRejection>,
) -> &'static str {
    let webhook = match payload {
        Ok(Json(webhook)) => webhook,
        Err(e) => {
            tracing::warn!("Unreadable voice-AI webhook: {}", e);
            return "OK";
        }
    };

    if webhook.event != CALL_ENDED {
        tracing::debug!("Ignoring voice-AI event {} for {}", webhook.event, webhook.call.call_id);
        return "OK";
    }

    if let Err(e) = enrich(&state, &webhook).await {
        tracing::error!("Enrichment for voice-AI call {} failed: {}", webhook.call.call_id, e);
    }
    "OK"
}

pub async fn enrich(state: &AppState, webhook: &VoiceAiWebhook) -> StoreResult<()> {
    let call_id = webhook.call.call_id.as_str();

    let detail = match state.voice_ai.get_call(call_id).await {
        Ok(detail) => detail,
        Err(e) => {
            tracing::error!("Failed to fetch voice-AI call {}: {}", call_id, e);
            return Ok(());
        }
    };

    let Some(record) = match_record(state, webhook, &detail).await? else {
        tracing::warn!("No call record for voice-AI call {}; enrichment dropped", call_id);
        return Ok(());
    };

    let analysis = detail.call_analysis.clone().unwrap_or_default();
    let enrichment = Enrichment {
        transcript: detail.transcript_text(),
        recording_url: detail.recording_url.clone(),
        sentiment: analysis.user_sentiment,
        call_summary: analysis.call_summary,
        voice_ai_call_id: Some(call_id.to_string()),
    };
    state.calls.merge_enrichment(record.id, &enrichment).await?;
    tracing::info!("Enriched call record {} from voice-AI call {}", record.id, call_id);

    if !record.is_terminal() {
        if let Some(ended_at) = detail.ended_at() {
            let update = StatusUpdate {
                status: CallStatus::Completed,
                duration_seconds: detail.duration_seconds(),
                observed_at: ended_at,
            };
            correlator::apply_update(state, record, update).await?;
        }
    }

    Ok(())
}

/// Voice-AI call id, then the record id echoed in metadata, then the
/// newest open record between the same two numbers.
async fn match_record(
    state: &AppState,
    webhook: &VoiceAiWebhook,
    detail: &CallDetail,
) -> StoreResult<Option<CallRecord>> {
    if let Some(record) = state.calls.find_by_voice_ai_call_id(&webhook.call.call_id).await? {
        return Ok(Some(record));
    }

    if let Some(id) = detail.call_record_id() {
        if let Some(record) = state.calls.get(id).await? {
            return Ok(Some(record));
        }
    }

    let from = detail.from_number.as_deref().or(webhook.call.from_number.as_deref());
    let to = detail.to_number.as_deref().or(webhook.call.to_number.as_deref());
    match (from, to) {
        (Some(from), Some(to)) => {
            let found = state.calls.find_open_by_participants(from, to).await?;
            if let Some(record) = &found {
                tracing::warn!(
                    "Matched voice-AI call {} to record {} by participants",
                    webhook.call.call_id, record.id
                );
            }
            Ok(found)
        }
        _ => Ok(None),
    }
}
