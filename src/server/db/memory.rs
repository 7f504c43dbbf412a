//! In-memory store used by handler tests. Mirrors the Postgres guards.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{BatchStore, CallStore, NumberDirectory, StoreError, StoreResult};
use crate::models::*;

#[derive(Default)]
pub struct MemoryStore {
    calls: RwLock<HashMap<Uuid, CallRecord>>,
    numbers: RwLock<Vec<ServiceNumber>>,
    agents: RwLock<Vec<AgentConfig>>,
    batches: RwLock<HashMap<Uuid, BatchCall>>,
    recipients: RwLock<Vec<BatchRecipient>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_number(&self, number: ServiceNumber) {
        self.numbers.write().await.push(number);
    }

    pub async fn add_agent(&self, agent: AgentConfig) {
        self.agents.write().await.push(agent);
    }

    pub async fn add_batch(&self, batch: BatchCall) {
        self.batches.write().await.insert(batch.id, batch);
    }

    pub async fn add_recipient(&self, recipient: BatchRecipient) {
        self.recipients.write().await.push(recipient);
    }

    pub async fn all_calls(&self) -> Vec<CallRecord> {
        let mut calls: Vec<CallRecord> = self.calls.read().await.values().cloned().collect();
        calls.sort_by_key(|c| c.created_at);
        calls
    }

    pub async fn batch(&self, id: Uuid) -> Option<BatchCall> {
        self.batches.read().await.get(&id).cloned()
    }

    pub async fn recipients_of(&self, batch_id: Uuid) -> Vec<BatchRecipient> {
        let mut list: Vec<BatchRecipient> = self
            .recipients
            .read()
            .await
            .iter()
            .filter(|r| r.batch_id == batch_id)
            .cloned()
            .collect();
        list.sort_by_key(|r| r.sort_order);
        list
    }
}

#[async_trait]
impl CallStore for MemoryStore {
    async fn insert(&self, new: NewCallRecord) -> StoreResult<CallRecord> {
        let mut calls = self.calls.write().await;
        if let Some(sid) = &new.provider_call_id {
            if calls.values().any(|c| c.provider_call_id.as_deref() == Some(sid.as_str())) {
                return Err(StoreError::DuplicateProviderCallId(sid.clone()));
            }
        }
        let now = Utc::now();
        let record = CallRecord {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            agent_id: new.agent_id,
            provider_call_id: new.provider_call_id,
            voice_ai_call_id: None,
            direction: new.direction,
            started_at: (new.status == CallStatus::InProgress).then_some(now),
            status: new.status,
            disposition: None,
            caller_number: new.caller_number,
            service_number: new.service_number,
            created_at: now,
            ended_at: None,
            duration_seconds: None,
            transcript: None,
            recording_url: None,
            sentiment: None,
            call_summary: None,
            parent_call_id: new.parent_call_id,
            leg_label: new.leg_label,
            conference_name: new.conference_name,
        };
        calls.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<CallRecord>> {
        Ok(self.calls.read().await.get(&id).cloned())
    }

    async fn find_by_provider_call_id(&self, provider_call_id: &str) -> StoreResult<Option<CallRecord>> {
        Ok(self
            .calls
            .read()
            .await
            .values()
            .find(|c| c.provider_call_id.as_deref() == Some(provider_call_id))
            .cloned())
    }

    async fn find_by_voice_ai_call_id(&self, voice_ai_call_id: &str) -> StoreResult<Option<CallRecord>> {
        Ok(self
            .calls
            .read()
            .await
            .values()
            .filter(|c| c.voice_ai_call_id.as_deref() == Some(voice_ai_call_id))
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn find_open_by_participants(&self, first: &str, second: &str) -> StoreResult<Option<CallRecord>> {
        Ok(self
            .calls
            .read()
            .await
            .values()
            .filter(|c| !c.is_terminal())
            .filter(|c| {
                (c.caller_number == first && c.service_number == second)
                    || (c.caller_number == second && c.service_number == first)
            })
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn find_recent_outbound(&self, destination: &str, since: DateTime<Utc>) -> StoreResult<Option<CallRecord>> {
        Ok(self
            .calls
            .read()
            .await
            .values()
            .filter(|c| {
                c.direction == CallDirection::Outbound
                    && c.provider_call_id.is_none()
                    && c.caller_number == destination
                    && c.created_at >= since
            })
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn find_transfer_leg(&self, parent_call_id: Uuid, conference: &str) -> StoreResult<Option<CallRecord>> {
        Ok(self
            .calls
            .read()
            .await
            .values()
            .filter(|c| {
                c.parent_call_id == Some(parent_call_id)
                    && c.conference_name.as_deref() == Some(conference)
            })
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn attach_provider_call_id(&self, id: Uuid, provider_call_id: &str) -> StoreResult<bool> {
        let mut calls = self.calls.write().await;
        if calls
            .values()
            .any(|c| c.id != id && c.provider_call_id.as_deref() == Some(provider_call_id))
        {
            return Err(StoreError::DuplicateProviderCallId(provider_call_id.to_string()));
        }
        match calls.get_mut(&id) {
            Some(record) if record.provider_call_id.is_none() => {
                record.provider_call_id = Some(provider_call_id.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn attach_voice_ai_call_id(&self, id: Uuid, voice_ai_call_id: &str) -> StoreResult<bool> {
        let mut calls = self.calls.write().await;
        match calls.get_mut(&id) {
            Some(record) if record.voice_ai_call_id.is_none() => {
                record.voice_ai_call_id = Some(voice_ai_call_id.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_conference(&self, id: Uuid, conference: &str) -> StoreResult<()> {
        if let Some(record) = self.calls.write().await.get_mut(&id) {
            record.conference_name = Some(conference.to_string());
        }
        Ok(())
    }

    async fn set_leg_label(&self, id: Uuid, leg_label: Option<&str>) -> StoreResult<()> {
        if let Some(record) = self.calls.write().await.get_mut(&id) {
            record.leg_label = leg_label.map(str::to_string);
        }
        Ok(())
    }

    async fn apply_status(&self, id: Uuid, expected: &CallStatus, patch: &StatusPatch) -> StoreResult<bool> {
        let mut calls = self.calls.write().await;
        match calls.get_mut(&id) {
            Some(record) if &record.status == expected && record.ended_at.is_none() => {
                record.status = patch.status.clone();
                record.started_at = record.started_at.or(patch.started_at);
                record.ended_at = record.ended_at.or(patch.ended_at);
                record.duration_seconds = patch.duration_seconds.or(record.duration_seconds);
                record.disposition = record.disposition.clone().or(patch.disposition.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn merge_enrichment(&self, id: Uuid, enrichment: &Enrichment) -> StoreResult<bool> {
        let mut calls = self.calls.write().await;
        let Some(record) = calls.get_mut(&id) else {
            return Ok(false);
        };
        if enrichment.transcript.is_some() {
            record.transcript = enrichment.transcript.clone();
        }
        if enrichment.recording_url.is_some() {
            record.recording_url = enrichment.recording_url.clone();
        }
        if enrichment.sentiment.is_some() {
            record.sentiment = enrichment.sentiment.clone();
        }
        if enrichment.call_summary.is_some() {
            record.call_summary = enrichment.call_summary.clone();
        }
        if record.voice_ai_call_id.is_none() {
            record.voice_ai_call_id = enrichment.voice_ai_call_id.clone();
        }
        Ok(true)
    }
}

#[async_trait]
impl NumberDirectory for MemoryStore {
    async fn find_active_number(&self, phone_number: &str) -> StoreResult<Option<ServiceNumber>> {
        Ok(self
            .numbers
            .read()
            .await
            .iter()
            .find(|n| n.is_active && n.phone_number == phone_number)
            .cloned())
    }

    async fn user_has_active_number(&self, user_id: Uuid, phone_number: &str) -> StoreResult<bool> {
        Ok(self
            .numbers
            .read()
            .await
            .iter()
            .any(|n| n.is_active && n.user_id == user_id && n.phone_number == phone_number))
    }

    async fn get_agent(&self, id: Uuid) -> StoreResult<Option<AgentConfig>> {
        Ok(self.agents.read().await.iter().find(|a| a.id == id).cloned())
    }

    async fn fallback_agent(&self, user_id: Uuid) -> StoreResult<Option<AgentConfig>> {
        let agents = self.agents.read().await;
        let mut owned: Vec<&AgentConfig> = agents.iter().filter(|a| a.user_id == user_id).collect();
        owned.sort_by_key(|a| (!a.is_default, a.created_at));
        Ok(owned.first().map(|a| (*a).clone()))
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn get_batch(&self, id: Uuid) -> StoreResult<Option<BatchCall>> {
        Ok(self.batches.read().await.get(&id).cloned())
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        let mut promoted = Vec::new();
        for batch in self.batches.write().await.values_mut() {
            let due = batch.scheduled_at.map(|at| at <= now).unwrap_or(false);
            if batch.status == BatchStatus::Scheduled && due {
                batch.status = BatchStatus::Running;
                batch.started_at = batch.started_at.or(Some(now));
                promoted.push(batch.id);
            }
        }
        Ok(promoted)
    }

    async fn running_batches(&self) -> StoreResult<Vec<Uuid>> {
        Ok(self
            .batches
            .read()
            .await
            .values()
            .filter(|b| b.status == BatchStatus::Running)
            .map(|b| b.id)
            .collect())
    }

    async fn count_recipients(&self, batch_id: Uuid, status: RecipientStatus) -> StoreResult<i64> {
        Ok(self
            .recipients
            .read()
            .await
            .iter()
            .filter(|r| r.batch_id == batch_id && r.status == status)
            .count() as i64)
    }

    async fn claim_pending(&self, batch_id: Uuid, limit: i64) -> StoreResult<Vec<BatchRecipient>> {
        let mut recipients = self.recipients.write().await;
        let mut pending: Vec<&mut BatchRecipient> = recipients
            .iter_mut()
            .filter(|r| r.batch_id == batch_id && r.status == RecipientStatus::Pending)
            .collect();
        pending.sort_by_key(|r| r.sort_order);
        let now = Utc::now();
        Ok(pending
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|r| {
                r.status = RecipientStatus::Calling;
                r.attempted_at = Some(now);
                r.clone()
            })
            .collect())
    }

    async fn link_call_record(&self, recipient_id: Uuid, call_record_id: Uuid) -> StoreResult<()> {
        if let Some(r) = self.recipients.write().await.iter_mut().find(|r| r.id == recipient_id) {
            r.call_record_id = Some(call_record_id);
        }
        Ok(())
    }

    async fn fail_recipient(&self, recipient_id: Uuid, message: &str) -> StoreResult<Option<Uuid>> {
        let batch_id = {
            let mut recipients = self.recipients.write().await;
            match recipients
                .iter_mut()
                .find(|r| r.id == recipient_id && r.status == RecipientStatus::Calling)
            {
                Some(r) => {
                    r.status = RecipientStatus::Failed;
                    r.error_message = Some(message.to_string());
                    r.completed_at = Some(Utc::now());
                    r.batch_id
                }
                None => return Ok(None),
            }
        };
        if let Some(batch) = self.batches.write().await.get_mut(&batch_id) {
            batch.failed_count += 1;
        }
        Ok(Some(batch_id))
    }

    async fn finish_recipient_for_call(
        &self,
        call_record_id: Uuid,
        success: bool,
        message: Option<&str>,
    ) -> StoreResult<Option<Uuid>> {
        let batch_id = {
            let mut recipients = self.recipients.write().await;
            match recipients.iter_mut().find(|r| {
                r.call_record_id == Some(call_record_id) && r.status == RecipientStatus::Calling
            }) {
                Some(r) => {
                    r.status = if success { RecipientStatus::Completed } else { RecipientStatus::Failed };
                    r.error_message = message.map(str::to_string);
                    r.completed_at = Some(Utc::now());
                    r.batch_id
                }
                None => return Ok(None),
            }
        };
        if let Some(batch) = self.batches.write().await.get_mut(&batch_id) {
            if success {
                batch.completed_count += 1;
            } else {
                batch.failed_count += 1;
            }
        }
        Ok(Some(batch_id))
    }

    async fn complete_if_drained(&self, batch_id: Uuid) -> StoreResult<bool> {
        let open = self.recipients.read().await.iter().any(|r| {
            r.batch_id == batch_id
                && matches!(r.status, RecipientStatus::Pending | RecipientStatus::Calling)
        });
        if open {
            return Ok(false);
        }
        let mut batches = self.batches.write().await;
        match batches.get_mut(&batch_id) {
            Some(batch) if batch.status == BatchStatus::Running => {
                batch.status = BatchStatus::Completed;
                batch.completed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient(batch_id: Uuid, sort_order: i32) -> BatchRecipient {
        BatchRecipient {
            id: Uuid::new_v4(),
            batch_id,
            phone_number: format!("+1604555{:04}", sort_order),
            name: None,
            status: RecipientStatus::Pending,
            call_record_id: None,
            error_message: None,
            sort_order,
            attempted_at: None,
            completed_at: None,
        }
    }

    fn running_batch() -> BatchCall {
        BatchCall {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "Reminders".to_string(),
            caller_id: "+15550000001".to_string(),
            status: BatchStatus::Running,
            max_concurrency: 2,
            scheduled_at: None,
            total_recipients: 3,
            completed_count: 0,
            failed_count: 0,
            started_at: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_provider_call_id_attaches_once() {
        let store = MemoryStore::new();
        let record = store
            .insert(NewCallRecord::inbound("+16045550100", "+16045550199", "CA1"))
            .await
            .unwrap();
        let other = store
            .insert(NewCallRecord::inbound("+16045550101", "+16045550199", "CA2"))
            .await
            .unwrap();

        assert!(!store.attach_provider_call_id(record.id, "CA9").await.unwrap());
        assert!(matches!(
            store.attach_provider_call_id(other.id, "CA1").await,
            Err(StoreError::DuplicateProviderCallId(_))
        ));
        assert!(matches!(
            store.insert(NewCallRecord::inbound("+16045550100", "+16045550199", "CA1")).await,
            Err(StoreError::DuplicateProviderCallId(_))
        ));
    }

    #[tokio::test]
    async fn test_status_patch_needs_expected_status() {
        let store = MemoryStore::new();
        let record = store
            .insert(NewCallRecord::inbound("+16045550100", "+16045550199", "CA1"))
            .await
            .unwrap();
        let ended = StatusPatch {
            status: CallStatus::Completed,
            started_at: None,
            ended_at: Some(Utc::now()),
            duration_seconds: Some(12),
            disposition: Some("inbound_completed".to_string()),
        };

        assert!(!store.apply_status(record.id, &CallStatus::Ringing, &ended).await.unwrap());
        assert!(store.apply_status(record.id, &record.status, &ended).await.unwrap());
        // ended_at is set now, so even a matching status is refused
        assert!(!store.apply_status(record.id, &CallStatus::Completed, &ended).await.unwrap());

        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Completed);
        assert_eq!(stored.duration_seconds, Some(12));
    }

    #[tokio::test]
    async fn test_stale_expected_status_loses() {
        let store = MemoryStore::new();
        let record = store
            .insert(NewCallRecord::outbound("+16045550100", "+16045550199"))
            .await
            .unwrap();
        let ringing = StatusPatch {
            status: CallStatus::Ringing,
            started_at: None,
            ended_at: None,
            duration_seconds: None,
            disposition: None,
        };
        let failed = StatusPatch {
            status: CallStatus::Failed,
            started_at: None,
            ended_at: Some(Utc::now()),
            duration_seconds: None,
            disposition: Some("outbound_failed".to_string()),
        };

        // Both writers decided from the same snapshot; only the first lands.
        assert!(store.apply_status(record.id, &record.status, &ringing).await.unwrap());
        assert!(!store.apply_status(record.id, &record.status, &failed).await.unwrap());

        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Ringing);
        assert!(stored.ended_at.is_none());
        assert!(stored.disposition.is_none());
    }

    #[tokio::test]
    async fn test_claim_and_finish_count_once() {
        let store = MemoryStore::new();
        let batch = running_batch();
        store.add_batch(batch.clone()).await;
        for i in 0..3 {
            store.add_recipient(recipient(batch.id, i)).await;
        }

        let claimed = store.claim_pending(batch.id, 2).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].sort_order, 0);
        assert_eq!(store.count_recipients(batch.id, RecipientStatus::Calling).await.unwrap(), 2);

        let call_id = Uuid::new_v4();
        store.link_call_record(claimed[0].id, call_id).await.unwrap();
        assert_eq!(
            store.finish_recipient_for_call(call_id, true, None).await.unwrap(),
            Some(batch.id)
        );
        assert_eq!(store.finish_recipient_for_call(call_id, true, None).await.unwrap(), None);

        assert_eq!(store.fail_recipient(claimed[1].id, "rejected").await.unwrap(), Some(batch.id));
        assert_eq!(store.fail_recipient(claimed[1].id, "rejected").await.unwrap(), None);

        let counted = store.batch(batch.id).await.unwrap();
        assert_eq!((counted.completed_count, counted.failed_count), (1, 1));
        assert!(!store.complete_if_drained(batch.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_due_scheduled_batch_promoted() {
        let store = MemoryStore::new();
        let mut batch = running_batch();
        batch.status = BatchStatus::Scheduled;
        batch.scheduled_at = Some(Utc::now() - chrono::Duration::minutes(1));
        store.add_batch(batch.clone()).await;

        assert_eq!(store.promote_due(Utc::now()).await.unwrap(), vec![batch.id]);
        assert_eq!(store.running_batches().await.unwrap(), vec![batch.id]);
        // nothing pending or calling
        assert!(store.complete_if_drained(batch.id).await.unwrap());
    }
}
