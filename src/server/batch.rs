//! Batch broadcast calls
//!
//! Recipients are claimed in bounded chunks, originated as agent-mode
//! calls, and finished by the same terminal status that finalizes their
//! call record. Counters move once per recipient because only the
//! `calling -> completed|failed` transition bumps them.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::models::{
    BatchStatus, CallStatus, DispatchSummary, InitiateCallRequest, OutboundMode, RecipientStatus,
};
use crate::server::{
    api_error, auth::Claims, correlator::is_success, db::StoreError, outbound, store_error,
    ApiResult, AppState,
};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Batch not found")]
    NotFound,
    #[error("Batch is {0:?}, not running")]
    NotRunning(BatchStatus),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Originate the next chunk of pending recipients of a running batch.
pub async fn dispatch(state: &AppState, batch_id: Uuid) -> Result<DispatchSummary, DispatchError> {
    let batch = state.batches.get_batch(batch_id).await?.ok_or(DispatchError::NotFound)?;
    if batch.status != BatchStatus::Running {
        return Err(DispatchError::NotRunning(batch.status));
    }

    let calling = state.batches.count_recipients(batch.id, RecipientStatus::Calling).await?;
    let slots = (batch.max_concurrency as i64 - calling).max(0);
    let limit = slots.min(state.config.batch.chunk_size as i64);

    let mut summary = DispatchSummary::default();

    if limit > 0 {
        let claimed = state.batches.claim_pending(batch.id, limit).await?;
        for (i, recipient) in claimed.iter().enumerate() {
            if i > 0 && !state.config.batch.call_delay.is_zero() {
                tokio::time::sleep(state.config.batch.call_delay).await;
            }

            let request = InitiateCallRequest {
                to: recipient.phone_number.clone(),
                from: Some(batch.caller_id.clone()),
                mode: OutboundMode::Agent,
                callback_number: None,
            };
            match outbound::initiate_call(state, Some(batch.user_id), &request, Some(recipient.id)).await {
                Ok(initiated) => {
                    tracing::info!(
                        "Batch {} recipient {} dialing as call record {}",
                        batch.id, recipient.id, initiated.record.id
                    );
                    summary.initiated += 1;
                }
                Err(e) => {
                    tracing::warn!("Batch {} recipient {} failed: {}", batch.id, recipient.id, e);
                    // No-op when the failed call record already finished it.
                    state.batches.fail_recipient(recipient.id, &e.to_string()).await?;
                    summary.failed += 1;
                }
            }
        }
    }

    summary.remaining = state.batches.count_recipients(batch.id, RecipientStatus::Pending).await?;
    summary.batch_completed = state.batches.complete_if_drained(batch.id).await?;
    summary.message = if summary.batch_completed {
        format!("Batch complete: {} initiated, {} failed", summary.initiated, summary.failed)
    } else if limit == 0 {
        format!("No free slots; {} recipients waiting", summary.remaining)
    } else {
        format!(
            "Initiated {} calls, {} failed, {} remaining",
            summary.initiated, summary.failed, summary.remaining
        )
    };

    tracing::info!("Batch {}: {}", batch.id, summary.message);
    Ok(summary)
}

/// Recipient error message for a call that ended without a conversation.
pub fn failure_message(status: &CallStatus) -> &'static str {
    match status {
        CallStatus::Busy => "Line busy",
        CallStatus::NoAnswer | CallStatus::Completed => "No answer",
        _ => "Call failed",
    }
}

/// Terminal hook: finish the batch recipient linked to this call, if any.
pub async fn on_call_finished(
    state: &AppState,
    call_record_id: Uuid,
    status: &CallStatus,
    disposition: Option<&str>,
) {
    let success = is_success(disposition);
    let message = (!success).then(|| failure_message(status));

    let batch_id = match state
        .batches
        .finish_recipient_for_call(call_record_id, success, message)
        .await
    {
        Ok(Some(batch_id)) => batch_id,
        Ok(None) => return,
        Err(e) => {
            tracing::error!("Failed to finish batch recipient for call {}: {}", call_record_id, e);
            return;
        }
    };

    tracing::info!(
        "Batch {} recipient for call {} finished ({})",
        batch_id, call_record_id, if success { "completed" } else { "failed" }
    );
    match state.batches.complete_if_drained(batch_id).await {
        Ok(true) => tracing::info!("Batch {} completed", batch_id),
        Ok(false) => {}
        Err(e) => tracing::error!("Failed to check batch {} for completion: {}", batch_id, e),
    }
}

/// Promote due scheduled batches and dispatch every running one.
pub async fn sweep(state: &AppState) {
    match state.batches.promote_due(Utc::now()).await {
        Ok(promoted) => {
            for id in promoted {
                tracing::info!("Scheduled batch {} is now running", id);
            }
        }
        Err(e) => tracing::error!("Failed to promote scheduled batches: {}", e),
    }

    let running = match state.batches.running_batches().await {
        Ok(running) => running,
        Err(e) => {
            tracing::error!("Failed to list running batches: {}", e);
            return;
        }
    };

    for batch_id in running {
        if let Err(e) = dispatch(state, batch_id).await {
            tracing::error!("Dispatch of batch {} failed: {}", batch_id, e);
        }
    }
}

/// Run [`sweep`] on the configured interval. `None` when sweeping is off.
pub fn spawn_sweeper(state: Arc<AppState>) -> Option<JoinHandle<()>> {
    let period = state.config.batch.sweep_interval?;
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sweep(&state).await;
        }
    }))
}

/// POST /api/batches/{id}/dispatch
pub async fn dispatch_handler(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Path(id): Path<Uuid>,
) -> ApiResult<DispatchSummary> {
    let batch = state
        .batches
        .get_batch(id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Batch not found"))?;
    if batch.user_id != claims.user_id() && !claims.is_admin() {
        return Err(api_error(StatusCode::FORBIDDEN, "Not your batch"));
    }

    match dispatch(&state, id).await {
        Ok(summary) => Ok(Json(summary)),
        Err(DispatchError::NotFound) => Err(api_error(StatusCode::NOT_FOUND, "Batch not found")),
        Err(e @ DispatchError::NotRunning(_)) => Err(api_error(StatusCode::CONFLICT, e.to_string())),
        Err(DispatchError::Store(e)) => Err(store_error(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_messages() {
        assert_eq!(failure_message(&CallStatus::Busy), "Line busy");
        assert_eq!(failure_message(&CallStatus::NoAnswer), "No answer");
        // completed without talk time never reached anyone
        assert_eq!(failure_message(&CallStatus::Completed), "No answer");
        assert_eq!(failure_message(&CallStatus::Canceled), "Call failed");
        assert_eq!(failure_message(&CallStatus::Failed), "Call failed");
    }
}
