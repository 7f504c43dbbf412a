//! Call status transitions
//!
//! Every status callback handler funnels through [`decide`]. Provider
//! vocabulary is mapped once here, terminality and ordering are checked
//! once here, and the resulting [`StatusPatch`] is what the stores apply
//! with a compare-and-set on the previous status.

use chrono::{DateTime, Duration, Utc};

use crate::models::{CallDirection, CallStatus, LegState, StatusPatch, StatusUpdate};

/// Result of mapping a provider status string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappedStatus {
    Known(CallStatus),
    Unknown(String),
}

/// Map the provider's status vocabulary onto [`CallStatus`].
pub fn map_provider_status(raw: &str) -> MappedStatus {
    let normalized = raw.trim().to_ascii_lowercase();
    let status = match normalized.as_str() {
        "queued" | "initiated" => CallStatus::Initiated,
        "ringing" => CallStatus::Ringing,
        "in-progress" | "in_progress" | "answered" => CallStatus::InProgress,
        "completed" => CallStatus::Completed,
        "busy" => CallStatus::Busy,
        "failed" => CallStatus::Failed,
        "no-answer" | "no_answer" => CallStatus::NoAnswer,
        "canceled" | "cancelled" => CallStatus::Canceled,
        _ => return MappedStatus::Unknown(raw.to_string()),
    };
    MappedStatus::Known(status)
}

/// Business outcome for a terminal status, e.g. `outbound_no_answer`.
/// Returns `None` for non-terminal statuses.
pub fn derive_disposition(
    direction: &CallDirection,
    status: &CallStatus,
    duration_seconds: Option<i32>,
) -> Option<String> {
    let outcome = match status {
        CallStatus::Completed if duration_seconds.unwrap_or(0) > 0 => "completed",
        CallStatus::Completed => "no_answer",
        CallStatus::NoAnswer => "no_answer",
        CallStatus::Busy => "busy",
        CallStatus::Failed => "failed",
        CallStatus::Canceled => "canceled",
        _ => return None,
    };
    Some(format!("{}_{}", direction.as_str(), outcome))
}

/// Disposition of a call handed off to an outside number.
pub fn transferred_disposition(direction: &CallDirection) -> String {
    format!("{}_transferred", direction.as_str())
}

/// Parse the RFC 2822 `Timestamp` field the provider puts on callbacks.
pub fn parse_callback_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc2822(s.trim()).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Write this patch, guarded on the status the decision was made from.
    Apply(StatusPatch),
    /// Same status as already recorded.
    Duplicate,
    /// Older non-terminal status arriving after a newer one.
    Stale,
    /// The record already ended; only enrichment may still change it.
    Frozen,
}

/// Decide how a status observation changes a leg.
pub fn decide(current: &LegState, update: &StatusUpdate) -> Transition {
    if current.ended_at.is_some() || current.status.is_terminal() {
        return if update.status == current.status {
            Transition::Duplicate
        } else {
            Transition::Frozen
        };
    }

    if update.status.is_terminal() {
        let ended_at = update.observed_at;
        let duration = update.duration_seconds.filter(|d| *d >= 0).or_else(|| {
            current
                .started_at
                .map(|started| (ended_at - started).num_seconds().max(0) as i32)
        });
        let started_at = match (current.started_at, duration) {
            (None, Some(d)) if d > 0 => Some(ended_at - Duration::seconds(d as i64)),
            _ => None,
        };
        return Transition::Apply(StatusPatch {
            status: update.status.clone(),
            started_at,
            ended_at: Some(ended_at),
            duration_seconds: duration,
            disposition: derive_disposition(&current.direction, &update.status, duration),
        });
    }

    let (from, to) = (current.status.rank(), update.status.rank());
    if to == from {
        return Transition::Duplicate;
    }
    if to < from {
        return Transition::Stale;
    }

    let started_at = if update.status == CallStatus::InProgress && current.started_at.is_none() {
        Some(update.observed_at)
    } else {
        None
    };
    Transition::Apply(StatusPatch {
        status: update.status.clone(),
        started_at,
        ended_at: None,
        duration_seconds: None,
        disposition: None,
    })
}

/// Fold a patch into a leg the same way the stores do: timestamps and
/// disposition are only filled when still empty.
pub fn apply_patch(current: &LegState, patch: &StatusPatch) -> LegState {
    LegState {
        direction: current.direction.clone(),
        status: patch.status.clone(),
        started_at: current.started_at.or(patch.started_at),
        ended_at: current.ended_at.or(patch.ended_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn leg(direction: CallDirection, status: CallStatus) -> LegState {
        LegState { direction, status, started_at: None, ended_at: None }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).single().unwrap()
    }

    fn update(status: CallStatus, duration: Option<i32>, secs: i64) -> StatusUpdate {
        StatusUpdate { status, duration_seconds: duration, observed_at: at(secs) }
    }

    #[test]
    fn test_map_provider_status() {
        assert_eq!(map_provider_status("in-progress"), MappedStatus::Known(CallStatus::InProgress));
        assert_eq!(map_provider_status("answered"), MappedStatus::Known(CallStatus::InProgress));
        assert_eq!(map_provider_status("no-answer"), MappedStatus::Known(CallStatus::NoAnswer));
        assert_eq!(map_provider_status("Cancelled"), MappedStatus::Known(CallStatus::Canceled));
        assert_eq!(map_provider_status("queued"), MappedStatus::Known(CallStatus::Initiated));
        assert_eq!(
            map_provider_status("voicemail"),
            MappedStatus::Unknown("voicemail".to_string())
        );
    }

    #[test]
    fn test_derive_disposition() {
        let out = CallDirection::Outbound;
        assert_eq!(derive_disposition(&out, &CallStatus::Completed, Some(42)).as_deref(), Some("outbound_completed"));
        assert_eq!(derive_disposition(&out, &CallStatus::Completed, Some(0)).as_deref(), Some("outbound_no_answer"));
        assert_eq!(derive_disposition(&out, &CallStatus::Completed, None).as_deref(), Some("outbound_no_answer"));
        assert_eq!(derive_disposition(&out, &CallStatus::Busy, None).as_deref(), Some("outbound_busy"));
        assert_eq!(
            derive_disposition(&CallDirection::Inbound, &CallStatus::Completed, Some(5)).as_deref(),
            Some("inbound_completed")
        );
        assert_eq!(derive_disposition(&out, &CallStatus::Ringing, None), None);
    }

    #[test]
    fn test_parse_callback_timestamp() {
        let parsed = parse_callback_timestamp(Some("Thu, 16 Oct 2025 14:03:12 +0000")).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2025, 10, 16, 14, 3, 12).unwrap());
        assert!(parse_callback_timestamp(Some("yesterday")).is_none());
        assert!(parse_callback_timestamp(None).is_none());
    }

    #[test]
    fn test_forward_progress_applies() {
        let current = leg(CallDirection::Outbound, CallStatus::Initiated);
        match decide(&current, &update(CallStatus::Ringing, None, 1)) {
            Transition::Apply(patch) => {
                assert_eq!(patch.status, CallStatus::Ringing);
                assert!(patch.started_at.is_none());
                assert!(patch.ended_at.is_none());
            }
            other => panic!("expected apply, got {:?}", other),
        }

        let ringing = leg(CallDirection::Outbound, CallStatus::Ringing);
        match decide(&ringing, &update(CallStatus::InProgress, None, 2)) {
            Transition::Apply(patch) => assert_eq!(patch.started_at, Some(at(2))),
            other => panic!("expected apply, got {:?}", other),
        }
    }

    #[test]
    fn test_late_ringing_is_stale() {
        let current = leg(CallDirection::Inbound, CallStatus::InProgress);
        assert_eq!(decide(&current, &update(CallStatus::Ringing, None, 5)), Transition::Stale);
        assert_eq!(decide(&current, &update(CallStatus::InProgress, None, 5)), Transition::Duplicate);
    }

    #[test]
    fn test_terminal_sets_end_and_backfills_start() {
        let current = leg(CallDirection::Inbound, CallStatus::Ringing);
        match decide(&current, &update(CallStatus::Completed, Some(42), 100)) {
            Transition::Apply(patch) => {
                assert_eq!(patch.ended_at, Some(at(100)));
                assert_eq!(patch.started_at, Some(at(58)));
                assert_eq!(patch.duration_seconds, Some(42));
                assert_eq!(patch.disposition.as_deref(), Some("inbound_completed"));
            }
            other => panic!("expected apply, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_duration_comes_from_start() {
        let mut current = leg(CallDirection::Inbound, CallStatus::InProgress);
        current.started_at = Some(at(10));
        match decide(&current, &update(CallStatus::Completed, None, 70)) {
            Transition::Apply(patch) => {
                assert_eq!(patch.duration_seconds, Some(60));
                assert_eq!(patch.disposition.as_deref(), Some("inbound_completed"));
            }
            other => panic!("expected apply, got {:?}", other),
        }
    }

    #[test]
    fn test_terminal_record_is_frozen() {
        let mut current = leg(CallDirection::Outbound, CallStatus::Completed);
        current.ended_at = Some(at(10));
        assert_eq!(decide(&current, &update(CallStatus::Completed, Some(9), 20)), Transition::Duplicate);
        assert_eq!(decide(&current, &update(CallStatus::Failed, None, 20)), Transition::Frozen);
        assert_eq!(decide(&current, &update(CallStatus::Ringing, None, 20)), Transition::Frozen);
    }

    fn any_status() -> impl Strategy<Value = CallStatus> {
        prop_oneof![
            Just(CallStatus::Initiated),
            Just(CallStatus::Ringing),
            Just(CallStatus::InProgress),
            Just(CallStatus::Completed),
            Just(CallStatus::Busy),
            Just(CallStatus::Failed),
            Just(CallStatus::NoAnswer),
            Just(CallStatus::Canceled),
        ]
    }

    fn any_update() -> impl Strategy<Value = StatusUpdate> {
        (any_status(), proptest::option::of(0i32..600), 0i64..10_000)
            .prop_map(|(status, duration, secs)| update(status, duration, secs))
    }

    fn run(updates: &[StatusUpdate]) -> (LegState, Option<String>) {
        let mut state = leg(CallDirection::Outbound, CallStatus::Initiated);
        let mut disposition = None;
        for u in updates {
            if let Transition::Apply(patch) = decide(&state, u) {
                if disposition.is_none() {
                    disposition = patch.disposition.clone();
                }
                state = apply_patch(&state, &patch);
            }
        }
        (state, disposition)
    }

    proptest! {
        #[test]
        fn prop_same_update_twice_is_idempotent(updates in proptest::collection::vec(any_update(), 1..12)) {
            let once = run(&updates);
            let doubled: Vec<StatusUpdate> = updates
                .iter()
                .flat_map(|u| [u.clone(), u.clone()])
                .collect();
            prop_assert_eq!(once, run(&doubled));
        }

        #[test]
        fn prop_first_terminal_wins(updates in proptest::collection::vec(any_update(), 1..16)) {
            let mut state = leg(CallDirection::Outbound, CallStatus::Initiated);
            let mut frozen: Option<(LegState, Option<String>)> = None;
            let mut disposition = None;
            for u in &updates {
                if let Transition::Apply(patch) = decide(&state, u) {
                    prop_assert!(frozen.is_none(), "applied a patch after a terminal status");
                    if disposition.is_none() {
                        disposition = patch.disposition.clone();
                    }
                    state = apply_patch(&state, &patch);
                }
                if state.status.is_terminal() && frozen.is_none() {
                    frozen = Some((state.clone(), disposition.clone()));
                }
                if let Some((snapshot, disp)) = &frozen {
                    prop_assert_eq!(&state, snapshot);
                    prop_assert_eq!(&disposition, disp);
                }
            }
        }

        #[test]
        fn prop_rank_never_decreases(updates in proptest::collection::vec(any_update(), 1..16)) {
            let mut state = leg(CallDirection::Inbound, CallStatus::Initiated);
            for u in &updates {
                if let Transition::Apply(patch) = decide(&state, u) {
                    let next = apply_patch(&state, &patch);
                    prop_assert!(next.status.rank() >= state.status.rank());
                    state = next;
                }
            }
        }
    }
}
