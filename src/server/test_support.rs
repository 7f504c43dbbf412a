//! Fakes and fixtures for handler tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    AgentConfig, CallRecord, CallStatus, Enrichment, NewCallRecord, ServiceNumber, StatusPatch,
};
use crate::server::{
    auth::create_token,
    callbacks::CallbackUrls,
    config::AppConfig,
    db::{memory::MemoryStore, CallStore, StoreResult},
    signalwire::{
        Carrier, NumberLookup, OriginateRequest, OriginatedCall, ProviderError, TelephonyProvider,
    },
    voice_ai::{CallDetail, RegisterCallRequest, VoiceAiBackend, VoiceAiError},
    AppState,
};

pub const BASE_URL: &str = "https://hooks.example.com";
pub const JWT_SECRET: &str = "test-jwt-secret";
pub const TICKET_SECRET: &str = "test-ticket-secret";
pub const SYSTEM_NUMBER: &str = "+15550000000";
pub const DEFAULT_CALLER_ID: &str = "+15550000001";
pub const SIP_DOMAIN: &str = "sip.voice.example.com";

pub fn test_config() -> AppConfig {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("DATABASE_URL", "postgres://localhost/test"),
        ("PUBLIC_BASE_URL", BASE_URL),
        ("SIGNALWIRE_PROJECT_ID", "project"),
        ("SIGNALWIRE_API_TOKEN", "token"),
        ("SIGNALWIRE_SPACE_URL", "example.signalwire.com"),
        ("VOICE_AI_API_KEY", "key"),
        ("JWT_SECRET", JWT_SECRET),
        ("BRIDGE_TICKET_SECRET", TICKET_SECRET),
        ("SYSTEM_NUMBER", SYSTEM_NUMBER),
        ("DEFAULT_CALLER_ID", DEFAULT_CALLER_ID),
        ("VOICE_AI_SIP_DOMAIN", SIP_DOMAIN),
        ("HOLD_MUSIC_URL", "https://cdn.example.com/hold.mp3"),
        ("BATCH_SWEEP_INTERVAL_SECS", "0"),
        ("BATCH_CALL_DELAY_MS", "0"),
        ("BATCH_CHUNK_SIZE", "5"),
    ]);
    AppConfig::from_vars(|name| vars.get(name).map(|v| v.to_string()))
        .expect("test config is valid")
}

/// Records every provider request; sids are handed out as `CA1`, `CA2`, ...
#[derive(Default)]
pub struct FakeProvider {
    pub originated: Mutex<Vec<OriginateRequest>>,
    pub terminated: Mutex<Vec<String>>,
    pub redirected: Mutex<Vec<(String, String)>>,
    /// Destinations whose origination is rejected.
    pub reject_to: Mutex<Vec<String>>,
    /// Numbers the lookup recognizes.
    pub known_numbers: Mutex<Vec<String>>,
    pub lookup_down: Mutex<bool>,
    next_sid: Mutex<u32>,
}

impl FakeProvider {
    pub fn reject(&self, to: &str) {
        self.reject_to.lock().unwrap().push(to.to_string());
    }

    pub fn originated(&self) -> Vec<OriginateRequest> {
        self.originated.lock().unwrap().clone()
    }

    pub fn redirected(&self) -> Vec<(String, String)> {
        self.redirected.lock().unwrap().clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait]
impl TelephonyProvider for FakeProvider {
    async fn originate(&self, request: &OriginateRequest) -> Result<OriginatedCall, ProviderError> {
        self.originated.lock().unwrap().push(request.clone());
        if self.reject_to.lock().unwrap().contains(&request.to) {
            return Err(ProviderError::Api { status: 400, message: "rejected".to_string() });
        }
        let mut next = self.next_sid.lock().unwrap();
        *next += 1;
        Ok(OriginatedCall { sid: format!("CA{}", *next), status: Some("queued".to_string()) })
    }

    async fn terminate(&self, call_sid: &str) -> Result<(), ProviderError> {
        self.terminated.lock().unwrap().push(call_sid.to_string());
        Ok(())
    }

    async fn redirect(&self, call_sid: &str, url: &str) -> Result<(), ProviderError> {
        self.redirected.lock().unwrap().push((call_sid.to_string(), url.to_string()));
        Ok(())
    }

    async fn lookup(&self, phone_number: &str) -> Result<NumberLookup, ProviderError> {
        if *self.lookup_down.lock().unwrap() {
            return Err(ProviderError::Api { status: 503, message: "unavailable".to_string() });
        }
        if !self.known_numbers.lock().unwrap().iter().any(|n| n == phone_number) {
            return Ok(NumberLookup { e164: None, national_number_formatted: None, carrier: None });
        }
        Ok(NumberLookup {
            e164: Some(phone_number.to_string()),
            national_number_formatted: None,
            carrier: Some(Carrier {
                lec: Some("Example Telecom".to_string()),
                linetype: Some("wireless".to_string()),
            }),
        })
    }
}

/// Voice-AI backend returning canned registrations and call details.
#[derive(Default)]
pub struct FakeVoiceAi {
    pub registrations: Mutex<Vec<RegisterCallRequest>>,
    pub fail_registration: Mutex<bool>,
    pub details: Mutex<HashMap<String, CallDetail>>,
}

impl FakeVoiceAi {
    pub fn add_detail(&self, detail: CallDetail) {
        self.details.lock().unwrap().insert(detail.call_id.clone(), detail);
    }
}

#[async_trait]
impl VoiceAiBackend for FakeVoiceAi {
    async fn register_phone_call(&self, request: &RegisterCallRequest) -> Result<String, VoiceAiError> {
        let mut registrations = self.registrations.lock().unwrap();
        registrations.push(request.clone());
        if *self.fail_registration.lock().unwrap() {
            return Err(VoiceAiError::Api { status: 503, message: "unavailable".to_string() });
        }
        Ok(format!("va_{}", registrations.len()))
    }

    async fn get_call(&self, call_id: &str) -> Result<CallDetail, VoiceAiError> {
        self.details
            .lock()
            .unwrap()
            .get(call_id)
            .cloned()
            .ok_or(VoiceAiError::Api { status: 404, message: "not found".to_string() })
    }
}

/// Call store where another writer lands a status write just before each
/// of ours, so the compare-and-set sees a record that moved underneath it.
pub struct ContendedStore {
    pub inner: Arc<MemoryStore>,
    /// Written ahead of the next status writes, one per write.
    pub competing: Mutex<VecDeque<StatusPatch>>,
    /// Refuse every status write.
    pub always_lose: bool,
}

impl ContendedStore {
    pub fn new(inner: Arc<MemoryStore>, competing: Vec<StatusPatch>) -> Self {
        Self { inner, competing: Mutex::new(competing.into()), always_lose: false }
    }

    pub fn always_losing(inner: Arc<MemoryStore>) -> Self {
        Self { always_lose: true, ..Self::new(inner, Vec::new()) }
    }
}

#[async_trait]
impl CallStore for ContendedStore {
    async fn insert(&self, new: NewCallRecord) -> StoreResult<CallRecord> {
        self.inner.insert(new).await
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<CallRecord>> {
        self.inner.get(id).await
    }

    async fn find_by_provider_call_id(&self, provider_call_id: &str) -> StoreResult<Option<CallRecord>> {
        self.inner.find_by_provider_call_id(provider_call_id).await
    }

    async fn find_by_voice_ai_call_id(&self, voice_ai_call_id: &str) -> StoreResult<Option<CallRecord>> {
        self.inner.find_by_voice_ai_call_id(voice_ai_call_id).await
    }

    async fn find_open_by_participants(&self, first: &str, second: &str) -> StoreResult<Option<CallRecord>> {
        self.inner.find_open_by_participants(first, second).await
    }

    async fn find_recent_outbound(&self, destination: &str, since: DateTime<Utc>) -> StoreResult<Option<CallRecord>> {
        self.inner.find_recent_outbound(destination, since).await
    }

    async fn find_transfer_leg(&self, parent_call_id: Uuid, conference: &str) -> StoreResult<Option<CallRecord>> {
        self.inner.find_transfer_leg(parent_call_id, conference).await
    }

    async fn attach_provider_call_id(&self, id: Uuid, provider_call_id: &str) -> StoreResult<bool> {
        self.inner.attach_provider_call_id(id, provider_call_id).await
    }

    async fn attach_voice_ai_call_id(&self, id: Uuid, voice_ai_call_id: &str) -> StoreResult<bool> {
        self.inner.attach_voice_ai_call_id(id, voice_ai_call_id).await
    }

    async fn set_conference(&self, id: Uuid, conference: &str) -> StoreResult<()> {
        self.inner.set_conference(id, conference).await
    }

    async fn set_leg_label(&self, id: Uuid, leg_label: Option<&str>) -> StoreResult<()> {
        self.inner.set_leg_label(id, leg_label).await
    }

    async fn apply_status(&self, id: Uuid, expected: &CallStatus, patch: &StatusPatch) -> StoreResult<bool> {
        if self.always_lose {
            return Ok(false);
        }
        let competing = self.competing.lock().unwrap().pop_front();
        if let Some(first) = competing {
            self.inner.apply_status(id, expected, &first).await?;
        }
        self.inner.apply_status(id, expected, patch).await
    }

    async fn merge_enrichment(&self, id: Uuid, enrichment: &Enrichment) -> StoreResult<bool> {
        self.inner.merge_enrichment(id, enrichment).await
    }
}

pub struct Harness {
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub provider: Arc<FakeProvider>,
    pub voice_ai: Arc<FakeVoiceAi>,
    pub user_id: Uuid,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(FakeProvider::default());
        let voice_ai = Arc::new(FakeVoiceAi::default());

        let state = Arc::new(AppState {
            calls: store.clone(),
            numbers: store.clone(),
            batches: store.clone(),
            provider: provider.clone(),
            voice_ai: voice_ai.clone(),
            urls: CallbackUrls::new(config.public_base_url.clone()),
            config: Arc::new(config),
        });

        Self { state, store, provider, voice_ai, user_id: Uuid::new_v4() }
    }

    /// Same collaborators, different call store.
    pub fn state_with_calls(&self, calls: Arc<dyn CallStore>) -> Arc<AppState> {
        Arc::new(AppState { calls, ..(*self.state).clone() })
    }

    pub fn token(&self) -> String {
        create_token(self.user_id, "user", JWT_SECRET).unwrap()
    }

    /// Lease `phone_number` to the harness user with an active agent behind it.
    pub async fn lease_number(&self, phone_number: &str) -> AgentConfig {
        let agent = AgentConfig {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            name: Some("Front desk".to_string()),
            voice_ai_agent_id: Some("agent_123".to_string()),
            is_active: true,
            is_default: true,
            calls_schedule: None,
            schedule_timezone: None,
            created_at: Utc::now(),
        };
        self.store.add_agent(agent.clone()).await;
        self.store
            .add_number(ServiceNumber {
                id: Uuid::new_v4(),
                user_id: self.user_id,
                phone_number: phone_number.to_string(),
                agent_id: Some(agent.id),
                is_active: true,
            })
            .await;
        agent
    }
}
