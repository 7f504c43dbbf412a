//! Inbound call routing
//!
//! Answers the provider's voice webhook for a leased number with a control
//! document: either a bridge to the owner's voice-AI agent or a spoken
//! decline. Unknown numbers never create a record.

use std::sync::Arc;

use axum::{
    extract::{rejection::FormRejection, State},
    Form,
};
use chrono::Utc;
use serde_json::json;

use crate::models::{AgentConfig, CallRecord, NewCallRecord, ServiceNumber};
use crate::server::{
    callbacks::{CallbackParams, LegRole},
    cxml::ControlDocument,
    db::{StoreError, StoreResult},
    schedule,
    signalwire::InboundCallForm,
    voice_ai::RegisterCallRequest,
    AppState,
};

pub const NUMBER_NOT_IN_SERVICE: &str = "The number you have called is not in service. Goodbye.";
pub const AGENT_NOT_CONFIGURED: &str =
    "The AI assistant is not configured yet. Please contact the account owner.";
pub const AGENT_UNAVAILABLE: &str =
    "The AI assistant is currently unavailable. Please try again later.";
pub const OUTSIDE_HOURS: &str =
    "Thank you for calling. We are currently outside of business hours. Please call back later.";

/// POST /webhooks/inbound-call
pub async fn handle_inbound_call(
    State(state): State<Arc<AppState>>,
    form: Result<Form<InboundCallForm>, FormRejection>,
) -> ControlDocument {
    let form = match form {
        Ok(Form(form)) => form,
        Err(e) => {
            tracing::warn!("Unreadable inbound call webhook: {}", e);
            return ControlDocument::error_fallback();
        }
    };

    match route(&state, &form).await {
        Ok(doc) => doc,
        Err(e) => {
            tracing::error!("Inbound routing failed for {:?}: {}", form.call_sid, e);
            ControlDocument::error_fallback()
        }
    }
}

async fn route(state: &AppState, form: &InboundCallForm) -> StoreResult<ControlDocument> {
    let (Some(to), Some(from), Some(call_sid)) = (
        present(&form.to),
        present(&form.from),
        present(&form.call_sid),
    ) else {
        tracing::warn!("Inbound webhook missing To, From or CallSid: {:?}", form);
        return Ok(ControlDocument::error_fallback());
    };

    tracing::info!("Inbound call {} from {} to {}", call_sid, from, to);

    let Some(number) = state.numbers.find_active_number(to).await? else {
        tracing::warn!("Inbound call {} to unassigned number {}", call_sid, to);
        return Ok(ControlDocument::decline(NUMBER_NOT_IN_SERVICE));
    };

    let Some(agent) = resolve_agent(state, &number).await? else {
        tracing::warn!("No agent configured for number {} (user {})", to, number.user_id);
        return Ok(ControlDocument::decline(AGENT_NOT_CONFIGURED));
    };
    let Some(voice_ai_agent_id) = agent.voice_ai_agent_id.clone() else {
        tracing::warn!("Agent {} has no voice-AI agent id", agent.id);
        return Ok(ControlDocument::decline(AGENT_NOT_CONFIGURED));
    };
    if !agent.is_active {
        tracing::info!("Agent {} is inactive; declining call {}", agent.id, call_sid);
        return Ok(ControlDocument::decline(AGENT_UNAVAILABLE));
    }
    if !schedule::is_open(
        agent.calls_schedule.as_ref().map(|s| &s.0),
        agent.schedule_timezone.as_deref(),
        Utc::now(),
    ) {
        tracing::info!("Call {} arrived outside agent {} hours", call_sid, agent.id);
        return Ok(ControlDocument::decline(OUTSIDE_HOURS));
    }

    // The call is answered regardless of whether the record could be written.
    let record = match record_for(state, &number, &agent, from, to, call_sid).await {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::error!("Failed to record inbound call {}: {}", call_sid, e);
            None
        }
    };

    let sip_uri = match record.as_ref().and_then(|r| r.voice_ai_call_id.clone()) {
        Some(existing) => voice_ai_uri(state, &existing),
        None => register(state, record.as_ref(), &voice_ai_agent_id, from, to, call_sid).await,
    };

    let action = record.as_ref().map(|r| {
        state
            .urls
            .dial_action(&CallbackParams::record(r.id).leg(LegRole::Primary))
    });

    Ok(ControlDocument::bridge_sip(&sip_uri, action))
}

/// The number's own agent, else the owner's fallback.
async fn resolve_agent(state: &AppState, number: &ServiceNumber) -> StoreResult<Option<AgentConfig>> {
    if let Some(agent_id) = number.agent_id {
        if let Some(agent) = state.numbers.get_agent(agent_id).await? {
            return Ok(Some(agent));
        }
        tracing::warn!("Number {} points at missing agent {}", number.phone_number, agent_id);
    }
    state.numbers.fallback_agent(number.user_id).await
}

/// Reuse the record of a redelivered webhook, else create one.
async fn record_for(
    state: &AppState,
    number: &ServiceNumber,
    agent: &AgentConfig,
    from: &str,
    to: &str,
    call_sid: &str,
) -> StoreResult<CallRecord> {
    if let Some(existing) = state.calls.find_by_provider_call_id(call_sid).await? {
        tracing::info!("Redelivered inbound webhook for {}; reusing record {}", call_sid, existing.id);
        return Ok(existing);
    }

    let new = NewCallRecord {
        user_id: Some(number.user_id),
        agent_id: Some(agent.id),
        ..NewCallRecord::inbound(from, to, call_sid)
    };
    match state.calls.insert(new).await {
        Ok(record) => {
            tracing::info!("Created call record {} for inbound call {}", record.id, call_sid);
            Ok(record)
        }
        Err(StoreError::DuplicateProviderCallId(sid)) => state
            .calls
            .find_by_provider_call_id(&sid)
            .await?
            .ok_or(StoreError::DuplicateProviderCallId(sid)),
        Err(e) => Err(e),
    }
}

/// Register the call with the voice-AI backend. On failure the caller is
/// still sent to the agent through the dispatch URI.
async fn register(
    state: &AppState,
    record: Option<&CallRecord>,
    voice_ai_agent_id: &str,
    from: &str,
    to: &str,
    call_sid: &str,
) -> String {
    let request = RegisterCallRequest {
        agent_id: voice_ai_agent_id.to_string(),
        from_number: from.to_string(),
        to_number: to.to_string(),
        direction: "inbound".to_string(),
        metadata: json!({
            "call_record_id": record.map(|r| r.id),
            "provider_call_id": call_sid,
            "user_id": record.and_then(|r| r.user_id),
        }),
    };

    match state.voice_ai.register_phone_call(&request).await {
        Ok(voice_ai_call_id) => {
            if let Some(record) = record {
                if let Err(e) = state.calls.attach_voice_ai_call_id(record.id, &voice_ai_call_id).await {
                    tracing::error!("Failed to link voice-AI call {} to {}: {}", voice_ai_call_id, record.id, e);
                }
            }
            voice_ai_uri(state, &voice_ai_call_id)
        }
        Err(e) => {
            tracing::warn!("Voice-AI registration failed for {}: {}; using dispatch URI", call_sid, e);
            state.config.routing.dispatch_sip_uri(to)
        }
    }
}

fn voice_ai_uri(state: &AppState, voice_ai_call_id: &str) -> String {
    format!("sip:{}@{}", voice_ai_call_id, state.config.routing.voice_ai_sip_domain)
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
