//! Status correlation
//!
//! Folds the provider's asynchronous, at-least-once, unordered status
//! callbacks into call records. Every write goes through
//! [`call_state::decide`] and a compare-and-set in the store, so parallel
//! and repeated deliveries converge on the first terminal status.

use std::sync::Arc;

use axum::{
    extract::{rejection::FormRejection, Query, State},
    Form,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::models::{CallRecord, CallStatus, Enrichment, StatusPatch, StatusUpdate};
use crate::server::{
    batch,
    call_state::{self, MappedStatus, Transition},
    callbacks::LegRole,
    conference,
    cxml::ControlDocument,
    db::{StoreError, StoreResult},
    signalwire::CallbackForm,
    AppState,
};

const MAX_ATTEMPTS: usize = 3;

/// Correlation ids this service put on the callback URL.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackQuery {
    pub call_record_id: Option<String>,
    pub conf: Option<String>,
    pub leg: Option<String>,
}

impl CallbackQuery {
    pub fn record_id(&self) -> Option<Uuid> {
        let raw = self.call_record_id.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        match Uuid::parse_str(raw) {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::warn!("Ignoring malformed call_record_id {:?} on callback", raw);
                None
            }
        }
    }

    pub fn leg(&self) -> Option<LegRole> {
        let raw = self.leg.as_deref()?;
        match raw.parse() {
            Ok(leg) => Some(leg),
            Err(e) => {
                tracing::warn!("Ignoring callback leg: {}", e);
                None
            }
        }
    }

    pub fn conference(&self) -> Option<&str> {
        self.conf.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }
}

/// What a callback did to its record.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Applied { status: CallStatus },
    Duplicate,
    Stale,
    Frozen,
    /// Lost every compare-and-set attempt.
    Contended,
    /// Callback for a leg that does not drive a record, or without a usable status.
    Ignored,
    /// No record could be matched.
    Unmatched,
}

/// Plain status callback. The provider only needs a 200.
pub async fn handle_call_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    form: Result<Form<CallbackForm>, FormRejection>,
) -> &'static str {
    let form = unpack_form(form);
    if let Err(e) = correlate(&state, &query, &form, false).await {
        tracing::error!(
            "Status callback for {:?} (record {:?}) failed: {}",
            form.call_sid, query.call_record_id, e
        );
    }
    "OK"
}

/// `<Dial action>` callback. Always answers with an explicit hangup so the
/// provider does not re-enter the dial.
pub async fn handle_dial_action(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    form: Result<Form<CallbackForm>, FormRejection>,
) -> ControlDocument {
    let form = unpack_form(form);
    if let Err(e) = correlate(&state, &query, &form, true).await {
        tracing::error!(
            "Dial action for {:?} (record {:?}) failed: {}",
            form.call_sid, query.call_record_id, e
        );
    }
    ControlDocument::hangup()
}

/// Recording status callback carrying the recording URL.
pub async fn handle_recording(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    form: Result<Form<CallbackForm>, FormRejection>,
) -> &'static str {
    let form = unpack_form(form);
    let (Some(record_id), Some(url)) = (query.record_id(), form.recording_url.clone()) else {
        tracing::warn!("Recording callback without record id or URL: {:?}", form.recording_sid);
        return "OK";
    };

    let enrichment = Enrichment { recording_url: Some(url), ..Default::default() };
    match state.calls.merge_enrichment(record_id, &enrichment).await {
        Ok(true) => tracing::info!("Recording attached to call record {}", record_id),
        Ok(false) => tracing::warn!("Recording for unknown call record {}", record_id),
        Err(e) => tracing::error!("Failed to store recording for {}: {}", record_id, e),
    }
    "OK"
}

fn unpack_form(form: Result<Form<CallbackForm>, FormRejection>) -> CallbackForm {
    match form {
        Ok(Form(form)) => form,
        Err(e) => {
            tracing::warn!("Unreadable callback body: {}", e);
            CallbackForm::default()
        }
    }
}

/// Correlate one callback with its record and apply the status it carries.
pub async fn correlate(
    state: &AppState,
    query: &CallbackQuery,
    form: &CallbackForm,
    dial_action: bool,
) -> StoreResult<Outcome> {
    let leg = query.leg();
    let call_sid = form.call_sid.as_deref().map(str::trim).filter(|s| !s.is_empty());

    if let Some(leg) = leg {
        if !leg.owns_record() {
            tracing::info!(
                "Callback for {} leg {:?} (conference {:?}) does not drive a record",
                leg, call_sid, query.conference()
            );
            return Ok(Outcome::Ignored);
        }
    }

    let Some(record) = locate(state, query.record_id(), call_sid, form.to.as_deref()).await? else {
        tracing::warn!(
            "No call record for callback {:?} (record {:?}, to {:?})",
            call_sid, query.call_record_id, form.to
        );
        return Ok(Outcome::Unmatched);
    };

    // A caller redirected into a transfer ends its original dial; that dial
    // outcome says nothing about the caller's own leg.
    let redirected = record.parent_call_id.is_none()
        && (record.conference_name.is_some()
            || record.leg_label.as_deref() == Some(conference::FORWARDED_LABEL));
    let dial_outcome = dial_action
        && leg.unwrap_or(LegRole::Primary).reports_dial_outcome()
        && !redirected;
    let (raw_status, duration) = form.observation(dial_outcome);

    let Some(raw_status) = raw_status else {
        tracing::warn!("Callback for call record {} carries no status", record.id);
        return Ok(Outcome::Ignored);
    };
    let status = match call_state::map_provider_status(raw_status) {
        MappedStatus::Known(status) => status,
        MappedStatus::Unknown(value) => {
            tracing::warn!("Unknown provider status {:?} for call record {}", value, record.id);
            return Ok(Outcome::Ignored);
        }
    };

    if let Some(sid) = call_sid {
        if record.provider_call_id.is_none() {
            match state.calls.attach_provider_call_id(record.id, sid).await {
                Ok(true) => tracing::info!("Linked provider call {} to call record {}", sid, record.id),
                Ok(false) => {}
                Err(StoreError::DuplicateProviderCallId(_)) => {
                    tracing::warn!("Provider call {} already linked elsewhere; record {} left unlinked", sid, record.id)
                }
                Err(e) => return Err(e),
            }
        }
    }

    let update = StatusUpdate {
        status,
        duration_seconds: duration,
        observed_at: call_state::parse_callback_timestamp(form.timestamp.as_deref())
            .unwrap_or_else(Utc::now),
    };
    apply_update(state, record, update).await
}

async fn locate(
    state: &AppState,
    record_id: Option<Uuid>,
    call_sid: Option<&str>,
    to: Option<&str>,
) -> StoreResult<Option<CallRecord>> {
    if let Some(id) = record_id {
        if let Some(record) = state.calls.get(id).await? {
            return Ok(Some(record));
        }
        tracing::warn!("Callback names call record {} which does not exist", id);
    }

    if let Some(sid) = call_sid {
        if let Some(record) = state.calls.find_by_provider_call_id(sid).await? {
            return Ok(Some(record));
        }
    }

    // Migration bridge for legs created without a correlation token.
    if let (Some(window), Some(to), None) = (state.config.legacy_correlation_window, to, record_id) {
        let since = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window));
        let Some(since) = since else {
            tracing::warn!("Legacy correlation window {:?} out of range", window);
            return Ok(None);
        };
        if let Some(record) = state.calls.find_recent_outbound(to.trim(), since).await? {
            tracing::warn!(
                "Matched callback {:?} to call record {} by destination {} and time window",
                call_sid, record.id, to
            );
            return Ok(Some(record));
        }
    }

    Ok(None)
}

/// Apply a status observation to a record through the central transition
/// function, retrying when a concurrent writer wins the compare-and-set.
pub async fn apply_update(
    state: &AppState,
    record: CallRecord,
    update: StatusUpdate,
) -> StoreResult<Outcome> {
    apply_update_as(state, record, update, None).await
}

/// [`apply_update`] with a fixed disposition for a terminal patch.
pub async fn apply_update_as(
    state: &AppState,
    mut record: CallRecord,
    update: StatusUpdate,
    disposition: Option<String>,
) -> StoreResult<Outcome> {
    for _ in 0..MAX_ATTEMPTS {
        let patch = match call_state::decide(&record.leg_state(), &update) {
            Transition::Apply(mut patch) => {
                if patch.status.is_terminal() && disposition.is_some() {
                    patch.disposition = disposition.clone();
                }
                patch
            }
            Transition::Duplicate => {
                tracing::debug!("Duplicate {} for call record {}", update.status, record.id);
                return Ok(Outcome::Duplicate);
            }
            Transition::Stale => {
                tracing::debug!(
                    "Stale {} for call record {} already at {}",
                    update.status, record.id, record.status
                );
                return Ok(Outcome::Stale);
            }
            Transition::Frozen => {
                tracing::info!(
                    "Call record {} already ended as {}; ignoring {}",
                    record.id, record.status, update.status
                );
                return Ok(Outcome::Frozen);
            }
        };

        if state.calls.apply_status(record.id, &record.status, &patch).await? {
            tracing::info!(
                "Call record {} {} -> {} (disposition {:?})",
                record.id, record.status, patch.status, patch.disposition
            );
            if patch.status.is_terminal() {
                after_terminal(state, &record, &patch).await;
            }
            return Ok(Outcome::Applied { status: patch.status });
        }

        match state.calls.get(record.id).await? {
            Some(fresh) => record = fresh,
            None => return Ok(Outcome::Unmatched),
        }
    }

    tracing::warn!("Gave up applying {} to call record {} after {} attempts", update.status, record.id, MAX_ATTEMPTS);
    Ok(Outcome::Contended)
}

pub fn is_success(disposition: Option<&str>) -> bool {
    disposition
        .map(|d| d.ends_with("_completed") || d.ends_with("_transferred"))
        .unwrap_or(false)
}

async fn after_terminal(state: &AppState, record: &CallRecord, patch: &StatusPatch) {
    batch::on_call_finished(state, record.id, &patch.status, patch.disposition.as_deref()).await;

    // A transferee that ends before it was merged leaves the caller parked,
    // even when it answered first.
    if record.leg_label.as_deref() == Some(LegRole::Transferee.as_str()) {
        conference::reconnect_parent(state, record).await;
    }
}
