//! Outbound call initiation
//!
//! Agent and callback modes originate a single leg to the voice-AI agent
//! whose control document (the bridge) then dials the destination.
//! Conference mode originates an agent leg and a PSTN leg into a shared
//! conference. The record is written before the provider is asked.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    CallRecord, CallStatus, InitiateCallRequest, InitiateCallResponse, NewCallRecord,
    OutboundMode, StatusUpdate,
};
use crate::server::{
    api_error,
    auth::{
        ticket::{BridgeTicket, TicketError},
        Claims,
    },
    callbacks::{CallbackParams, LegRole},
    correlator,
    cxml::{ControlDocument, Dial, DialTarget},
    db::StoreError,
    phone::normalize_e164,
    signalwire::{OriginateRequest, ProviderError},
    store_error, ApiResult, AppState,
};

pub const BRIDGE_FAILED: &str = "We could not connect your call. Please try again later.";

const DIAL_TIMEOUT_SECS: u32 = 60;
const AGENT_GREETING_PAUSE_SECS: u32 = 3;

#[derive(Error, Debug)]
pub enum InitiateError {
    #[error("Invalid destination number: {0}")]
    InvalidDestination(String),
    #[error("Refusing to dial the system number")]
    CallLoop,
    #[error("Caller id {0} is not an active number on this account")]
    CallerIdNotOwned(String),
    #[error("Callback mode requires a valid callback number")]
    MissingCallbackNumber,
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Ticket error: {0}")]
    Ticket(#[from] TicketError),
    #[error("Provider rejected the call: {0}")]
    Provider(#[from] ProviderError),
}

impl InitiateError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            InitiateError::InvalidDestination(_)
            | InitiateError::CallLoop
            | InitiateError::MissingCallbackNumber => StatusCode::BAD_REQUEST,
            InitiateError::CallerIdNotOwned(_) => StatusCode::FORBIDDEN,
            InitiateError::Store(_) | InitiateError::Ticket(_) => StatusCode::INTERNAL_SERVER_ERROR,
            InitiateError::Provider(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// A created record and the provider id of the leg it tracks.
#[derive(Debug, Clone)]
pub struct Initiated {
    pub record: CallRecord,
    pub provider_call_id: String,
}

/// Create the record, then originate. `recipient_id` links a batch
/// recipient to the record before the provider can report on it.
pub async fn initiate_call(
    state: &AppState,
    user_id: Option<Uuid>,
    request: &InitiateCallRequest,
    recipient_id: Option<Uuid>,
) -> Result<Initiated, InitiateError> {
    let routing = &state.config.routing;

    let destination = normalize_e164(&request.to)
        .ok_or_else(|| InitiateError::InvalidDestination(request.to.clone()))?;
    if routing.is_system_number(&destination) {
        return Err(InitiateError::CallLoop);
    }

    let caller_id = match request.from.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
        Some(from) => {
            let from = normalize_e164(from).ok_or_else(|| InitiateError::CallerIdNotOwned(from.to_string()))?;
            let owned = match user_id {
                Some(user_id) => state.numbers.user_has_active_number(user_id, &from).await?,
                None => false,
            };
            if !owned && from != routing.default_caller_id {
                return Err(InitiateError::CallerIdNotOwned(from));
            }
            from
        }
        None => routing.default_caller_id.clone(),
    };

    let callback_number = match request.mode {
        OutboundMode::Callback => Some(
            request
                .callback_number
                .as_deref()
                .and_then(normalize_e164)
                .ok_or(InitiateError::MissingCallbackNumber)?,
        ),
        _ => None,
    };

    let record = state
        .calls
        .insert(NewCallRecord {
            user_id,
            ..NewCallRecord::outbound(&destination, &caller_id)
        })
        .await?;
    tracing::info!(
        "Created call record {} for outbound {:?} call to {}",
        record.id, request.mode, destination
    );

    if let Some(recipient_id) = recipient_id {
        state.batches.link_call_record(recipient_id, record.id).await?;
    }

    let originated = match request.mode {
        OutboundMode::Agent | OutboundMode::Callback => {
            originate_bridged(state, &record, &destination, &caller_id, request.mode, callback_number).await
        }
        OutboundMode::Conference => originate_conference(state, &record, &destination, &caller_id).await,
    };

    let provider_call_id = match originated {
        Ok(sid) => sid,
        Err(e) => {
            tracing::error!("Origination failed for call record {}: {}", record.id, e);
            mark_failed(state, record).await;
            return Err(e);
        }
    };

    match state.calls.attach_provider_call_id(record.id, &provider_call_id).await {
        Ok(true) => {}
        Ok(false) => tracing::debug!("Call record {} was linked by an early callback", record.id),
        Err(e) => tracing::error!("Failed to link {} to call record {}: {}", provider_call_id, record.id, e),
    }

    Ok(Initiated { record, provider_call_id })
}

async fn originate_bridged(
    state: &AppState,
    record: &CallRecord,
    destination: &str,
    caller_id: &str,
    mode: OutboundMode,
    callback_number: Option<String>,
) -> Result<String, InitiateError> {
    let ticket = BridgeTicket::new(
        record.id,
        destination,
        caller_id,
        mode,
        state.config.bridge_ticket_ttl,
    )
    .sign(&state.config.bridge_ticket_secret)?;

    let to = callback_number.unwrap_or_else(|| state.config.routing.agent_sip_uri());
    let call = state
        .provider
        .originate(&OriginateRequest {
            to,
            from: caller_id.to_string(),
            url: state.urls.bridge(&ticket),
            status_callback: state
                .urls
                .call_status(&CallbackParams::record(record.id).leg(LegRole::Primary)),
            timeout_secs: Some(DIAL_TIMEOUT_SECS),
        })
        .await?;
    Ok(call.sid)
}

async fn originate_conference(
    state: &AppState,
    record: &CallRecord,
    destination: &str,
    caller_id: &str,
) -> Result<String, InitiateError> {
    let conference = format!("outbound_{}", record.id.simple());
    state.calls.set_conference(record.id, &conference).await?;

    let agent_params = CallbackParams::record(record.id)
        .conference(&conference)
        .leg(LegRole::Agent);
    let agent_leg = state
        .provider
        .originate(&OriginateRequest {
            to: state.config.routing.agent_sip_uri(),
            from: caller_id.to_string(),
            url: state.urls.conference(&agent_params),
            status_callback: state.urls.call_status(&agent_params),
            timeout_secs: None,
        })
        .await?;

    let pstn_params = CallbackParams::record(record.id)
        .conference(&conference)
        .leg(LegRole::Pstn);
    let pstn_leg = state
        .provider
        .originate(&OriginateRequest {
            to: destination.to_string(),
            from: caller_id.to_string(),
            url: state.urls.conference(&pstn_params),
            status_callback: state.urls.call_status(&pstn_params),
            timeout_secs: Some(DIAL_TIMEOUT_SECS),
        })
        .await;

    match pstn_leg {
        Ok(call) => Ok(call.sid),
        Err(e) => {
            if let Err(hangup) = state.provider.terminate(&agent_leg.sid).await {
                tracing::warn!("Failed to hang up orphaned agent leg {}: {}", agent_leg.sid, hangup);
            }
            Err(e.into())
        }
    }
}

/// Record an origination failure through the normal status path.
pub(crate) async fn mark_failed(state: &AppState, record: CallRecord) {
    let id = record.id;
    let update = StatusUpdate {
        status: CallStatus::Failed,
        duration_seconds: None,
        observed_at: Utc::now(),
    };
    if let Err(e) = correlator::apply_update(state, record, update).await {
        tracing::error!("Failed to mark call record {} failed: {}", id, e);
    }
}

/// POST /api/calls
pub async fn create_call(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Json(request): Json<InitiateCallRequest>,
) -> ApiResult<InitiateCallResponse> {
    match initiate_call(&state, Some(claims.user_id()), &request, None).await {
        Ok(initiated) => Ok(Json(InitiateCallResponse {
            call_record_id: initiated.record.id,
            provider_call_id: initiated.provider_call_id,
            status: initiated.record.status,
        })),
        Err(InitiateError::Store(e)) => Err(store_error(e)),
        Err(e) => Err(api_error(e.status_code(), e.to_string())),
    }
}

/// Load a record the caller is allowed to see.
pub(crate) async fn owned_record(
    state: &AppState,
    claims: &Claims,
    id: Uuid,
) -> Result<CallRecord, (StatusCode, Json<crate::server::ApiError>)> {
    let record = state
        .calls
        .get(id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Call not found"))?;

    if record.user_id != Some(claims.user_id()) && !claims.is_admin() {
        return Err(api_error(StatusCode::FORBIDDEN, "Not your call"));
    }
    Ok(record)
}

/// GET /api/calls/{id}
pub async fn get_call(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path(id): Path<Uuid>,
) -> ApiResult<CallRecord> {
    owned_record(&state, &claims, id).await.map(Json)
}

/// POST /api/calls/{id}/terminate
pub async fn terminate_call(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path(id): Path<Uuid>,
) -> ApiResult<CallRecord> {
    let record = owned_record(&state, &claims, id).await?;
    if record.is_terminal() {
        return Err(api_error(StatusCode::CONFLICT, "Call already ended"));
    }
    let Some(sid) = record.provider_call_id.as_deref() else {
        return Err(api_error(StatusCode::CONFLICT, "Call has no live provider leg"));
    };

    state.provider.terminate(sid).await.map_err(|e| {
        tracing::error!("Provider failed to terminate {}: {}", sid, e);
        api_error(StatusCode::BAD_GATEWAY, format!("Provider error: {}", e))
    })?;
    tracing::info!("Requested termination of call {} (record {})", sid, record.id);

    // The provider's completed callback finalizes the record.
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct BridgeQuery {
    pub ticket: Option<String>,
}

/// GET/POST /webhooks/bridge?ticket=
///
/// Control document for the agent leg of an agent- or callback-mode call.
pub async fn handle_bridge(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BridgeQuery>,
) -> ControlDocument {
    let Some(token) = query.ticket.as_deref() else {
        tracing::warn!("Bridge request without a ticket");
        return ControlDocument::decline(BRIDGE_FAILED);
    };

    let ticket = match BridgeTicket::verify(token, &state.config.bridge_ticket_secret) {
        Ok(ticket) => ticket,
        Err(e) => {
            tracing::warn!("Rejected bridge ticket: {}", e);
            return ControlDocument::decline(BRIDGE_FAILED);
        }
    };

    bridge_document(&state, &ticket)
}

pub fn bridge_document(state: &AppState, ticket: &BridgeTicket) -> ControlDocument {
    let record_id = ticket.call_record_id();
    let dial = Dial::new(DialTarget::Number {
        number: ticket.destination.clone(),
        status_callback: Some(
            state
                .urls
                .call_status(&CallbackParams::record(record_id).leg(LegRole::Pstn)),
        ),
    })
    .action(
        state
            .urls
            .dial_action(&CallbackParams::record(record_id).leg(LegRole::Primary)),
    )
    .timeout(DIAL_TIMEOUT_SECS)
    .caller_id(ticket.caller_id.clone())
    .record_from_answer(Some(state.urls.recording(record_id)));

    match ticket.mode {
        OutboundMode::Agent if !ticket.whisper => ControlDocument::new()
            .pause(AGENT_GREETING_PAUSE_SECS)
            .dial(dial),
        OutboundMode::Agent | OutboundMode::Callback => ControlDocument::new()
            .say(format!("Connecting your call to {}.", ticket.destination))
            .dial(dial),
        OutboundMode::Conference => {
            tracing::warn!("Bridge ticket for conference-mode record {}", record_id);
            ControlDocument::decline(BRIDGE_FAILED)
        }
    }
}
