//! Server-side code for the call orchestrator
//!
//! This module contains all backend functionality:
//! - Database access (PostgreSQL via sqlx)
//! - SignalWire call control and LaML documents
//! - Voice-AI registration and post-call enrichment
//! - Status callback correlation
//! - Authentication (JWT) and API routes, including number lookup

pub mod auth;
pub mod batch;
pub mod call_state;
pub mod callbacks;
pub mod conference;
pub mod config;
pub mod correlator;
pub mod cxml;
pub mod db;
pub mod enrichment;
pub mod inbound;
pub mod numbers;
pub mod outbound;
pub mod phone;
pub mod schedule;
pub mod signalwire;
pub mod voice_ai;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    http::{Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use callbacks::CallbackUrls;
use config::AppConfig;
use db::{BatchStore, CallStore, NumberDirectory, PgStore, StoreError};
use signalwire::{SignalWireClient, TelephonyProvider};
use voice_ai::{VoiceAiBackend, VoiceAiClient};

/// Application state shared across all routes
#[derive(Clone)]
pub struct AppState {
    pub calls: Arc<dyn CallStore>,
    pub numbers: Arc<dyn NumberDirectory>,
    pub batches: Arc<dyn BatchStore>,
    pub provider: Arc<dyn TelephonyProvider>,
    pub voice_ai: Arc<dyn VoiceAiBackend>,
    pub config: Arc<AppConfig>,
    pub urls: CallbackUrls,
}

/// Error body for the user-facing API.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
}

pub type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (status, Json(ApiError { message: message.into() }))
}

/// Storage failures are logged and reported without their details.
pub(crate) fn store_error(e: StoreError) -> (StatusCode, Json<ApiError>) {
    tracing::error!("Store error: {}", e);
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

/// Create the Axum router with all API and webhook routes
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/api/health", get(health_check))

        // Call routes
        .route("/api/calls", post(outbound::create_call))
        .route("/api/calls/{id}", get(outbound::get_call))
        .route("/api/calls/{id}/terminate", post(outbound::terminate_call))
        .route("/api/calls/{id}/transfer", post(conference::start_transfer_handler))
        .route("/api/calls/{id}/transfer/merge", post(conference::merge_transfer_handler))
        .route("/api/calls/{id}/transfer/cancel", post(conference::cancel_transfer_handler))
        .route("/api/calls/{id}/transfer/cold", post(conference::cold_transfer_handler))

        // Number routes
        .route("/api/numbers/lookup", post(numbers::lookup_number))

        // Batch routes
        .route("/api/batches/{id}/dispatch", post(batch::dispatch_handler))

        // Provider webhooks
        .route("/webhooks/inbound-call", post(inbound::handle_inbound_call))
        .route("/webhooks/bridge", get(outbound::handle_bridge).post(outbound::handle_bridge))
        .route("/webhooks/conference", get(conference::handle_conference).post(conference::handle_conference))
        .route("/webhooks/conference-events", post(conference::handle_conference_event))
        .route("/webhooks/forward", get(conference::handle_forward).post(conference::handle_forward))
        .route("/webhooks/call-status", post(correlator::handle_call_status))
        .route("/webhooks/dial-action", post(correlator::handle_dial_action))
        .route("/webhooks/recording", post(correlator::handle_recording))
        .route("/webhooks/voice-ai", post(enrichment::handle_voice_ai_webhook))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Health check
async fn health_check() -> &'static str {
    "OK"
}

/// Initialize and start the server
pub async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    let pool = db::init_pool(&config.database_url)
        .await
        .context("failed to connect to the database")?;
    db::run_migrations(&pool)
        .await
        .context("failed to apply migrations")?;

    let store = Arc::new(PgStore::new(pool));
    let port = config.port;

    let state = Arc::new(AppState {
        calls: store.clone(),
        numbers: store.clone(),
        batches: store,
        provider: Arc::new(SignalWireClient::new(&config.signalwire)),
        voice_ai: Arc::new(VoiceAiClient::new(&config.voice_ai)),
        urls: CallbackUrls::new(config.public_base_url.clone()),
        config: Arc::new(config),
    });

    match batch::spawn_sweeper(state.clone()) {
        Some(_) => tracing::info!("Batch sweeper started"),
        None => tracing::info!("Batch sweeper disabled"),
    }

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!("Server running on http://0.0.0.0:{}", port);

    axum::serve(listener, app).await?;

    Ok(())
}
