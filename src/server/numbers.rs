//! Phone number lookup

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};

use crate::models::{CarrierInfo, NumberLookupRequest, NumberLookupResponse};
use crate::server::{api_error, auth::Claims, phone::normalize_e164, ApiResult, AppState};

/// POST /api/numbers/lookup
pub async fn lookup_number(
    State(state): State<Arc<AppState>>,
    claims: Claims,
    Json(request): Json<NumberLookupRequest>,
) -> ApiResult<NumberLookupResponse> {
    let Some(normalized) = normalize_e164(&request.phone_number) else {
        return Err(api_error(StatusCode::BAD_REQUEST, "Invalid phone number"));
    };

    let lookup = state.provider.lookup(&normalized).await.map_err(|e| {
        tracing::error!("Number lookup for {} (user {}) failed: {}", normalized, claims.user_id(), e);
        api_error(StatusCode::BAD_GATEWAY, format!("Provider error: {}", e))
    })?;

    Ok(Json(NumberLookupResponse {
        valid: lookup.e164.is_some(),
        phone_number: lookup.e164.unwrap_or(normalized),
        national_format: lookup.national_number_formatted,
        carrier: lookup.carrier.map(|c| CarrierInfo {
            linetype: c.linetype,
            name: c.lec,
        }),
    }))
}
