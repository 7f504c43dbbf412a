//! Conferences and warm transfer
//!
//! Each participant leg fetches its own conference document; the leg role
//! on the URL decides its enter/exit semantics. A warm transfer parks the
//! caller on hold, consults the target, then merges the target into the
//! caller's conference. A failed or canceled transfer sends the caller
//! back to the agent. A cold transfer hands the caller straight to an
//! outside number and closes the record as transferred.

use std::sync::Arc;

use axum::{
    extract::{rejection::FormRejection, Path, Query, State},
    http::StatusCode,
    Form, Json,
};
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    CallDirection, CallRecord, CallStatus, NewCallRecord, OutboundMode, StatusUpdate,
    TransferLegRequest, TransferRequest, TransferResponse,
};
use crate::server::{
    api_error,
    auth::{
        ticket::{BridgeTicket, TicketError},
        Claims,
    },
    call_state,
    callbacks::{CallbackParams, LegRole},
    correlator::{self, CallbackQuery},
    cxml::{ConferenceOptions, ControlDocument, Dial, DialTarget},
    db::StoreError,
    outbound::{mark_failed, owned_record, BridgeQuery},
    phone::normalize_e164,
    signalwire::{ConferenceEventForm, OriginateRequest, ProviderError},
    store_error, ApiResult, AppState,
};

pub const CONSULT_BRIEFING: &str =
    "You have a transferred call. The assistant will brief you before you are connected.";
pub const RECONNECTING: &str = "Sorry, the transfer did not go through. Reconnecting you now.";

pub const FORWARD_FAILED: &str = "We could not transfer your call. Goodbye.";

/// Leg label of a transferee once it has joined the caller's conference.
pub const MERGED_LABEL: &str = "merged";
/// Leg label of a caller handed off by a cold transfer.
pub const FORWARDED_LABEL: &str = "forwarded";

const CONSULT_TIMEOUT_SECS: u32 = 30;
const FORWARD_TIMEOUT_SECS: u32 = 60;

/// GET/POST /webhooks/conference?leg=&conf=&call_record_id=
pub async fn handle_conference(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> ControlDocument {
    match conference_document(&state, &query).await {
        Ok(doc) => doc,
        Err(e) => {
            tracing::error!("Conference document failed for {:?}: {}", query, e);
            ControlDocument::error_fallback()
        }
    }
}

pub async fn conference_document(
    state: &AppState,
    query: &CallbackQuery,
) -> Result<ControlDocument, StoreError> {
    let Some(leg) = query.leg() else {
        tracing::warn!("Conference request without a leg role: {:?}", query);
        return Ok(ControlDocument::error_fallback());
    };
    let record_id = query.record_id();

    if leg == LegRole::Reconnect {
        return reconnect_document(state, record_id).await;
    }

    let Some(conference) = query.conference() else {
        tracing::warn!("Conference request for {} leg without a conference name", leg);
        return Ok(ControlDocument::error_fallback());
    };

    let params = CallbackParams {
        call_record_id: record_id,
        conference: Some(conference),
        leg: Some(leg),
    };
    let action = state.urls.dial_action(&params);
    let recording = record_id.map(|id| state.urls.recording(id));

    let mut options = match leg {
        LegRole::Agent => ConferenceOptions {
            start_on_enter: true,
            end_on_exit: false,
            beep: false,
            ..Default::default()
        },
        LegRole::Pstn => ConferenceOptions {
            start_on_enter: true,
            end_on_exit: true,
            beep: false,
            record: Some("record-from-start"),
            recording_status_callback: recording,
            ..Default::default()
        },
        LegRole::Hold => ConferenceOptions {
            start_on_enter: false,
            end_on_exit: true,
            beep: false,
            wait_url: state.config.routing.hold_music_url.clone(),
            ..Default::default()
        },
        LegRole::Transferee => ConferenceOptions {
            start_on_enter: true,
            end_on_exit: false,
            beep: false,
            record: Some("record-from-start"),
            recording_status_callback: recording,
            ..Default::default()
        },
        LegRole::Consult => {
            let dial = Dial::new(DialTarget::Sip { uri: state.config.routing.agent_sip_uri() })
                .action(action);
            return Ok(ControlDocument::new().say(CONSULT_BRIEFING).dial(dial));
        }
        LegRole::Primary | LegRole::Reconnect | LegRole::Forward => {
            tracing::warn!("No conference document for {} leg", leg);
            return Ok(ControlDocument::error_fallback());
        }
    };

    options.status_callback = Some(state.urls.conference_events(&params));

    let dial = Dial::new(DialTarget::Conference {
        name: conference.to_string(),
        options,
    })
    .action(action);
    Ok(ControlDocument::new().dial(dial))
}

/// POST /webhooks/conference-events?call_record_id=&conf=&leg=
///
/// Participant movements are logged against the record; leg status
/// arrives through the per-leg status callbacks.
pub async fn handle_conference_event(
    Query(query): Query<CallbackQuery>,
    form: Result<Form<ConferenceEventForm>, FormRejection>,
) -> &'static str {
    let event = match form {
        Ok(Form(event)) => event,
        Err(e) => {
            tracing::warn!("Unreadable conference event: {}", e);
            return "OK";
        }
    };
    let conference = event
        .friendly_name
        .as_deref()
        .or(query.conference())
        .unwrap_or("unknown");
    match event.status_callback_event.as_deref() {
        Some(kind) => tracing::info!(
            "Conference {} ({:?}) {} for {} leg, call {:?}, record {:?}",
            conference,
            event.conference_sid,
            kind,
            query.leg().map(|l| l.as_str()).unwrap_or("unknown"),
            event.call_sid,
            query.call_record_id
        ),
        None => tracing::warn!("Conference event for {} without an event name", conference),
    }
    "OK"
}

async fn reconnect_document(
    state: &AppState,
    record_id: Option<Uuid>,
) -> Result<ControlDocument, StoreError> {
    let record = match record_id {
        Some(id) => state.calls.get(id).await?,
        None => None,
    };
    let Some(record) = record else {
        tracing::warn!("Reconnect requested for unknown call record {:?}", record_id);
        return Ok(ControlDocument::error_fallback());
    };

    let uri = state.config.routing.dispatch_sip_uri(&record.service_number);
    let action = state
        .urls
        .dial_action(&CallbackParams::record(record.id).leg(LegRole::Reconnect));
    Ok(ControlDocument::new()
        .say(RECONNECTING)
        .dial(Dial::new(DialTarget::Sip { uri }).action(action)))
}

/// Send a parked caller back to the agent after its transfer leg ended
/// without being merged.
pub async fn reconnect_parent(state: &AppState, child: &CallRecord) {
    // The label is re-read: a merge may have landed after the callback
    // loaded the record.
    let child = match state.calls.get(child.id).await {
        Ok(Some(fresh)) => fresh,
        Ok(None) => return,
        Err(e) => {
            tracing::error!("Failed to reload transfer leg {}: {}", child.id, e);
            return;
        }
    };
    if child.leg_label.as_deref() != Some(LegRole::Transferee.as_str()) {
        tracing::info!("Transfer leg {} was merged; caller stays in the conference", child.id);
        return;
    }
    let (Some(parent_id), Some(conference)) = (child.parent_call_id, child.conference_name.as_deref()) else {
        return;
    };

    let parent = match state.calls.get(parent_id).await {
        Ok(Some(parent)) => parent,
        Ok(None) => {
            tracing::warn!("Transfer leg {} has no parent {}", child.id, parent_id);
            return;
        }
        Err(e) => {
            tracing::error!("Failed to load parent {} of transfer leg {}: {}", parent_id, child.id, e);
            return;
        }
    };

    if parent.is_terminal() || parent.conference_name.as_deref() != Some(conference) {
        tracing::info!("Caller {} is not parked in {}; nothing to reconnect", parent.id, conference);
        return;
    }
    let Some(sid) = parent.provider_call_id.as_deref() else {
        tracing::warn!("Parked caller {} has no provider leg", parent.id);
        return;
    };

    let url = state
        .urls
        .conference(&CallbackParams::record(parent.id).conference(conference).leg(LegRole::Reconnect));
    match state.provider.redirect(sid, &url).await {
        Ok(()) => tracing::info!("Reconnecting caller {} after failed transfer {}", parent.id, child.id),
        Err(e) => tracing::error!("Failed to reconnect caller {}: {}", parent.id, e),
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Invalid transfer target: {0}")]
    InvalidTarget(String),
    #[error("Refusing to transfer to the system number")]
    CallLoop,
    #[error("Call already ended")]
    CallEnded,
    #[error("Call has no live provider leg")]
    NoLiveLeg,
    #[error("Only inbound and conference calls can be transferred")]
    Unsupported,
    #[error("No transfer in progress for conference {0}")]
    NotInProgress(String),
    #[error("Ticket error: {0}")]
    Ticket(#[from] TicketError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

impl TransferError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TransferError::InvalidTarget(_) | TransferError::CallLoop => StatusCode::BAD_REQUEST,
            TransferError::CallEnded | TransferError::NoLiveLeg | TransferError::Unsupported => {
                StatusCode::CONFLICT
            }
            TransferError::NotInProgress(_) => StatusCode::NOT_FOUND,
            TransferError::Store(_) | TransferError::Ticket(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TransferError::Provider(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Park the caller on hold and ring the transfer target.
pub async fn start_transfer(
    state: &AppState,
    parent: &CallRecord,
    target: &str,
) -> Result<TransferResponse, TransferError> {
    if parent.is_terminal() {
        return Err(TransferError::CallEnded);
    }
    // Bridged outbound records track the agent-side leg, which is not the
    // party a transfer should move.
    if parent.direction == CallDirection::Outbound && parent.conference_name.is_none() {
        return Err(TransferError::Unsupported);
    }
    let parent_sid = parent.provider_call_id.as_deref().ok_or(TransferError::NoLiveLeg)?;

    let target = normalize_e164(target).ok_or_else(|| TransferError::InvalidTarget(target.to_string()))?;
    if state.config.routing.is_system_number(&target) {
        return Err(TransferError::CallLoop);
    }

    let conference = format!("transfer_{}", Uuid::new_v4().simple());
    let child = state
        .calls
        .insert(NewCallRecord {
            user_id: parent.user_id,
            agent_id: parent.agent_id,
            provider_call_id: None,
            direction: CallDirection::Outbound,
            status: CallStatus::Initiated,
            caller_number: target.clone(),
            service_number: parent.service_number.clone(),
            parent_call_id: Some(parent.id),
            leg_label: Some(LegRole::Transferee.as_str().to_string()),
            conference_name: Some(conference.clone()),
        })
        .await?;
    tracing::info!("Starting transfer of {} to {} in {}", parent.id, target, conference);

    let hold_url = state
        .urls
        .conference(&CallbackParams::record(parent.id).conference(&conference).leg(LegRole::Hold));
    if let Err(e) = state.provider.redirect(parent_sid, &hold_url).await {
        // The caller was never moved, so failing the leg reconnects nobody.
        mark_failed(state, child).await;
        return Err(e.into());
    }
    state.calls.set_conference(parent.id, &conference).await?;

    let consult = state
        .provider
        .originate(&OriginateRequest {
            to: target.clone(),
            from: parent.service_number.clone(),
            url: state.urls.conference(
                &CallbackParams::record(child.id).conference(&conference).leg(LegRole::Consult),
            ),
            status_callback: state.urls.call_status(
                &CallbackParams::record(child.id).conference(&conference).leg(LegRole::Transferee),
            ),
            timeout_secs: Some(CONSULT_TIMEOUT_SECS),
        })
        .await;

    let call = match consult {
        Ok(call) => call,
        Err(e) => {
            tracing::error!("Failed to ring transfer target {}: {}", target, e);
            mark_failed(state, child).await;
            return Err(e.into());
        }
    };

    if let Err(e) = state.calls.attach_provider_call_id(child.id, &call.sid).await {
        tracing::error!("Failed to link transfer leg {} to {}: {}", call.sid, child.id, e);
    }

    Ok(TransferResponse {
        conference,
        transferee_record_id: child.id,
        transferee_call_id: Some(call.sid),
    })
}

async fn open_transfer_leg(
    state: &AppState,
    parent: &CallRecord,
    conference: &str,
) -> Result<CallRecord, TransferError> {
    state
        .calls
        .find_transfer_leg(parent.id, conference)
        .await?
        .ok_or_else(|| TransferError::NotInProgress(conference.to_string()))
}

/// Move the consulted target into the caller's conference.
pub async fn merge_transfer(
    state: &AppState,
    parent: &CallRecord,
    conference: &str,
) -> Result<CallRecord, TransferError> {
    let child = open_transfer_leg(state, parent, conference).await?;
    if child.is_terminal() {
        return Err(TransferError::CallEnded);
    }
    let sid = child.provider_call_id.as_deref().ok_or(TransferError::NoLiveLeg)?;

    let url = state
        .urls
        .conference(&CallbackParams::record(child.id).conference(conference).leg(LegRole::Transferee));
    // Stamped before the redirect so a hangup racing the merge does not
    // pull the caller back out of the conference.
    state.calls.set_leg_label(child.id, Some(MERGED_LABEL)).await?;
    if let Err(e) = state.provider.redirect(sid, &url).await {
        state.calls.set_leg_label(child.id, Some(LegRole::Transferee.as_str())).await?;
        return Err(e.into());
    }
    tracing::info!("Merged transfer leg {} into {}", child.id, conference);

    state
        .calls
        .get(child.id)
        .await?
        .ok_or_else(|| TransferError::NotInProgress(conference.to_string()))
}

/// Abandon the transfer: end the target's leg and reconnect the caller.
pub async fn cancel_transfer(
    state: &AppState,
    parent: &CallRecord,
    conference: &str,
) -> Result<CallRecord, TransferError> {
    let child = open_transfer_leg(state, parent, conference).await?;
    let sid = child.provider_call_id.clone();
    let child_id = child.id;

    if !child.is_terminal() {
        let update = StatusUpdate {
            status: CallStatus::Canceled,
            duration_seconds: None,
            observed_at: Utc::now(),
        };
        correlator::apply_update(state, child, update).await?;
    }

    if let Some(sid) = sid {
        if let Err(e) = state.provider.terminate(&sid).await {
            tracing::warn!("Failed to hang up canceled transfer leg {}: {}", sid, e);
        }
    }

    state
        .calls
        .get(child_id)
        .await?
        .ok_or_else(|| TransferError::NotInProgress(conference.to_string()))
}

/// Hand the caller to an outside number without consulting it first.
/// The record closes as transferred once the provider accepts the redirect.
pub async fn cold_transfer(
    state: &AppState,
    record: &CallRecord,
    target: &str,
) -> Result<CallRecord, TransferError> {
    if record.is_terminal() {
        return Err(TransferError::CallEnded);
    }
    if record.direction == CallDirection::Outbound && record.conference_name.is_none() {
        return Err(TransferError::Unsupported);
    }
    let sid = record.provider_call_id.as_deref().ok_or(TransferError::NoLiveLeg)?;

    let target = normalize_e164(target).ok_or_else(|| TransferError::InvalidTarget(target.to_string()))?;
    if state.config.routing.is_system_number(&target) {
        return Err(TransferError::CallLoop);
    }

    let ticket = BridgeTicket::new(
        record.id,
        &target,
        &record.service_number,
        OutboundMode::Agent,
        state.config.bridge_ticket_ttl,
    )
    .sign(&state.config.bridge_ticket_secret)?;

    // The caller's interrupted dial reports back once redirected; the label
    // keeps that report from finishing the record first.
    state.calls.set_leg_label(record.id, Some(FORWARDED_LABEL)).await?;
    if let Err(e) = state.provider.redirect(sid, &state.urls.forward(&ticket)).await {
        state.calls.set_leg_label(record.id, record.leg_label.as_deref()).await?;
        return Err(e.into());
    }
    tracing::info!("Forwarded call record {} ({}) to {}", record.id, sid, target);

    let current = state
        .calls
        .get(record.id)
        .await?
        .ok_or(TransferError::CallEnded)?;
    let update = StatusUpdate {
        status: CallStatus::Completed,
        duration_seconds: None,
        observed_at: Utc::now(),
    };
    let disposition = call_state::transferred_disposition(&record.direction);
    correlator::apply_update_as(state, current, update, Some(disposition)).await?;

    state.calls.get(record.id).await?.ok_or(TransferError::CallEnded)
}

/// GET/POST /webhooks/forward?ticket=
pub async fn handle_forward(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BridgeQuery>,
) -> ControlDocument {
    let Some(token) = query.ticket.as_deref() else {
        tracing::warn!("Forward request without a ticket");
        return ControlDocument::decline(FORWARD_FAILED);
    };
    match BridgeTicket::verify(token, &state.config.bridge_ticket_secret) {
        Ok(ticket) => forward_document(&state, &ticket),
        Err(e) => {
            tracing::warn!("Rejected forward ticket: {}", e);
            ControlDocument::decline(FORWARD_FAILED)
        }
    }
}

pub fn forward_document(state: &AppState, ticket: &BridgeTicket) -> ControlDocument {
    let action = state
        .urls
        .dial_action(&CallbackParams::record(ticket.call_record_id()).leg(LegRole::Forward));
    let dial = Dial::new(DialTarget::Number {
        number: ticket.destination.clone(),
        status_callback: None,
    })
    .action(action)
    .timeout(FORWARD_TIMEOUT_SECS)
    .caller_id(ticket.caller_id.clone());
    ControlDocument::new().dial(dial)
}

fn transfer_error(e: TransferError) -> (StatusCode, Json<crate::server::ApiError>) {
    match e {
        TransferError::Store(e) => store_error(e),
        e => api_error(e.status_code(), e.to_string()),
    }
}

/// POST /api/calls/{id}/transfer
pub async fn start_transfer_handler(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path(id): Path<Uuid>,
    Json(request): Json<TransferRequest>,
) -> ApiResult<TransferResponse> {
    let parent = owned_record(&state, &claims, id).await?;
    start_transfer(&state, &parent, &request.target_number)
        .await
        .map(Json)
        .map_err(transfer_error)
}

/// POST /api/calls/{id}/transfer/cold
pub async fn cold_transfer_handler(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path(id): Path<Uuid>,
    Json(request): Json<TransferRequest>,
) -> ApiResult<CallRecord> {
    let record = owned_record(&state, &claims, id).await?;
    cold_transfer(&state, &record, &request.target_number)
        .await
        .map(Json)
        .map_err(transfer_error)
}

/// POST /api/calls/{id}/transfer/merge
pub async fn merge_transfer_handler(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path(id): Path<Uuid>,
    Json(request): Json<TransferLegRequest>,
) -> ApiResult<CallRecord> {
    let parent = owned_record(&state, &claims, id).await?;
    merge_transfer(&state, &parent, &request.conference)
        .await
        .map(Json)
        .map_err(transfer_error)
}

/// POST /api/calls/{id}/transfer/cancel
pub async fn cancel_transfer_handler(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path(id): Path<Uuid>,
    Json(request): Json<TransferLegRequest>,
) -> ApiResult<CallRecord> {
    let parent = owned_record(&state, &claims, id).await?;
    cancel_transfer(&state, &parent, &request.conference)
        .await
        .map(Json)
        .map_err(transfer_error)
}
