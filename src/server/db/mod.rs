//! Database access layer using sqlx with PostgreSQL
//!
//! Handlers talk to the stores through the traits below so the call flows
//! can be exercised against [`memory::MemoryStore`] in tests.

pub mod calls;
pub mod numbers;
pub mod batches;
#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    AgentConfig, BatchCall, BatchRecipient, CallRecord, CallStatus, Enrichment, NewCallRecord,
    RecipientStatus, ServiceNumber, StatusPatch,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(sqlx::Error),
    #[error("Provider call id {0} is already linked to another record")]
    DuplicateProviderCallId(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence for call records.
#[async_trait]
pub trait CallStore: Send + Sync {
    async fn insert(&self, new: NewCallRecord) -> StoreResult<CallRecord>;
    async fn get(&self, id: Uuid) -> StoreResult<Option<CallRecord>>;
    async fn find_by_provider_call_id(&self, provider_call_id: &str) -> StoreResult<Option<CallRecord>>;
    async fn find_by_voice_ai_call_id(&self, voice_ai_call_id: &str) -> StoreResult<Option<CallRecord>>;
    /// Newest record between the two numbers, either orientation, not yet ended.
    async fn find_open_by_participants(&self, first: &str, second: &str) -> StoreResult<Option<CallRecord>>;
    /// Newest unlinked outbound record to `destination` created after `since`.
    async fn find_recent_outbound(&self, destination: &str, since: DateTime<Utc>) -> StoreResult<Option<CallRecord>>;
    async fn find_transfer_leg(&self, parent_call_id: Uuid, conference: &str) -> StoreResult<Option<CallRecord>>;
    /// Returns false when the record already has a provider call id.
    async fn attach_provider_call_id(&self, id: Uuid, provider_call_id: &str) -> StoreResult<bool>;
    async fn attach_voice_ai_call_id(&self, id: Uuid, voice_ai_call_id: &str) -> StoreResult<bool>;
    async fn set_conference(&self, id: Uuid, conference: &str) -> StoreResult<()>;
    async fn set_leg_label(&self, id: Uuid, leg_label: Option<&str>) -> StoreResult<()>;
    /// Compare-and-set on `expected` status and an unset `ended_at`.
    async fn apply_status(&self, id: Uuid, expected: &CallStatus, patch: &StatusPatch) -> StoreResult<bool>;
    async fn merge_enrichment(&self, id: Uuid, enrichment: &Enrichment) -> StoreResult<bool>;
}

/// Leased numbers and the agents behind them.
#[async_trait]
pub trait NumberDirectory: Send + Sync {
    async fn find_active_number(&self, phone_number: &str) -> StoreResult<Option<ServiceNumber>>;
    async fn user_has_active_number(&self, user_id: Uuid, phone_number: &str) -> StoreResult<bool>;
    async fn get_agent(&self, id: Uuid) -> StoreResult<Option<AgentConfig>>;
    /// Default agent for the user, else their oldest.
    async fn fallback_agent(&self, user_id: Uuid) -> StoreResult<Option<AgentConfig>>;
}

/// Batch broadcast calls and their recipients.
#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn get_batch(&self, id: Uuid) -> StoreResult<Option<BatchCall>>;
    async fn promote_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Uuid>>;
    async fn running_batches(&self) -> StoreResult<Vec<Uuid>>;
    async fn count_recipients(&self, batch_id: Uuid, status: RecipientStatus) -> StoreResult<i64>;
    async fn claim_pending(&self, batch_id: Uuid, limit: i64) -> StoreResult<Vec<BatchRecipient>>;
    async fn link_call_record(&self, recipient_id: Uuid, call_record_id: Uuid) -> StoreResult<()>;
    /// Marks a calling recipient failed and bumps `failed_count`.
    async fn fail_recipient(&self, recipient_id: Uuid, message: &str) -> StoreResult<Option<Uuid>>;
    /// Finishes the calling recipient linked to a call. Returns its batch id
    /// only when this call made the change.
    async fn finish_recipient_for_call(
        &self,
        call_record_id: Uuid,
        success: bool,
        message: Option<&str>,
    ) -> StoreResult<Option<Uuid>>;
    async fn complete_if_drained(&self, batch_id: Uuid) -> StoreResult<bool>;
}

/// Initialize the database connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Postgres implementation of every store trait.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl CallStore for PgStore {
    async fn insert(&self, new: NewCallRecord) -> StoreResult<CallRecord> {
        match calls::create(&self.pool, &new).await {
            Ok(record) => Ok(record),
            Err(e) if unique_violation(&e) => Err(StoreError::DuplicateProviderCallId(
                new.provider_call_id.unwrap_or_default(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<CallRecord>> {
        Ok(calls::get_by_id(&self.pool, id).await?)
    }

    async fn find_by_provider_call_id(&self, provider_call_id: &str) -> StoreResult<Option<CallRecord>> {
        Ok(calls::get_by_provider_call_id(&self.pool, provider_call_id).await?)
    }

    async fn find_by_voice_ai_call_id(&self, voice_ai_call_id: &str) -> StoreResult<Option<CallRecord>> {
        Ok(calls::get_by_voice_ai_call_id(&self.pool, voice_ai_call_id).await?)
    }

    async fn find_open_by_participants(&self, first: &str, second: &str) -> StoreResult<Option<CallRecord>> {
        Ok(calls::get_open_by_participants(&self.pool, first, second).await?)
    }

    async fn find_recent_outbound(&self, destination: &str, since: DateTime<Utc>) -> StoreResult<Option<CallRecord>> {
        Ok(calls::get_recent_unlinked_outbound(&self.pool, destination, since).await?)
    }

    async fn find_transfer_leg(&self, parent_call_id: Uuid, conference: &str) -> StoreResult<Option<CallRecord>> {
        Ok(calls::get_transfer_leg(&self.pool, parent_call_id, conference).await?)
    }

    async fn attach_provider_call_id(&self, id: Uuid, provider_call_id: &str) -> StoreResult<bool> {
        match calls::set_provider_call_id_if_unset(&self.pool, id, provider_call_id).await {
            Ok(changed) => Ok(changed),
            Err(e) if unique_violation(&e) => {
                Err(StoreError::DuplicateProviderCallId(provider_call_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn attach_voice_ai_call_id(&self, id: Uuid, voice_ai_call_id: &str) -> StoreResult<bool> {
        Ok(calls::set_voice_ai_call_id_if_unset(&self.pool, id, voice_ai_call_id).await?)
    }

    async fn set_conference(&self, id: Uuid, conference: &str) -> StoreResult<()> {
        Ok(calls::set_conference(&self.pool, id, conference).await?)
    }

    async fn set_leg_label(&self, id: Uuid, leg_label: Option<&str>) -> StoreResult<()> {
        Ok(calls::set_leg_label(&self.pool, id, leg_label).await?)
    }

    async fn apply_status(&self, id: Uuid, expected: &CallStatus, patch: &StatusPatch) -> StoreResult<bool> {
        Ok(calls::apply_status_patch(&self.pool, id, expected, patch).await?)
    }

    async fn merge_enrichment(&self, id: Uuid, enrichment: &Enrichment) -> StoreResult<bool> {
        Ok(calls::merge_enrichment(&self.pool, id, enrichment).await?)
    }
}

#[async_trait]
impl NumberDirectory for PgStore {
    async fn find_active_number(&self, phone_number: &str) -> StoreResult<Option<ServiceNumber>> {
        Ok(numbers::get_active_number(&self.pool, phone_number).await?)
    }

    async fn user_has_active_number(&self, user_id: Uuid, phone_number: &str) -> StoreResult<bool> {
        Ok(numbers::user_has_active_number(&self.pool, user_id, phone_number).await?)
    }

    async fn get_agent(&self, id: Uuid) -> StoreResult<Option<AgentConfig>> {
        Ok(numbers::get_agent(&self.pool, id).await?)
    }

    async fn fallback_agent(&self, user_id: Uuid) -> StoreResult<Option<AgentConfig>> {
        Ok(numbers::get_fallback_agent(&self.pool, user_id).await?)
    }
}

#[async_trait]
impl BatchStore for PgStore {
    async fn get_batch(&self, id: Uuid) -> StoreResult<Option<BatchCall>> {
        Ok(batches::get_by_id(&self.pool, id).await?)
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        Ok(batches::promote_due(&self.pool, now).await?)
    }

    async fn running_batches(&self) -> StoreResult<Vec<Uuid>> {
        Ok(batches::running_ids(&self.pool).await?)
    }

    async fn count_recipients(&self, batch_id: Uuid, status: RecipientStatus) -> StoreResult<i64> {
        Ok(batches::count_recipients(&self.pool, batch_id, &status).await?)
    }

    async fn claim_pending(&self, batch_id: Uuid, limit: i64) -> StoreResult<Vec<BatchRecipient>> {
        Ok(batches::claim_pending(&self.pool, batch_id, limit).await?)
    }

    async fn link_call_record(&self, recipient_id: Uuid, call_record_id: Uuid) -> StoreResult<()> {
        Ok(batches::link_call_record(&self.pool, recipient_id, call_record_id).await?)
    }

    async fn fail_recipient(&self, recipient_id: Uuid, message: &str) -> StoreResult<Option<Uuid>> {
        Ok(batches::fail_recipient(&self.pool, recipient_id, message).await?)
    }

    async fn finish_recipient_for_call(
        &self,
        call_record_id: Uuid,
        success: bool,
        message: Option<&str>,
    ) -> StoreResult<Option<Uuid>> {
        Ok(batches::finish_recipient_for_call(&self.pool, call_record_id, success, message).await?)
    }

    async fn complete_if_drained(&self, batch_id: Uuid) -> StoreResult<bool> {
        Ok(batches::complete_if_drained(&self.pool, batch_id).await?)
    }
}
