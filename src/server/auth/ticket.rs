//! Bridge tickets
//!
//! The bridging document is fetched by the provider in a separate request
//! from the one that originated the call. Everything it needs travels in a
//! short-lived HS256 token on its URL.

use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::OutboundMode;

#[derive(Error, Debug, PartialEq)]
pub enum TicketError {
    #[error("Bridge ticket expired")]
    Expired,
    #[error("Bridge ticket invalid: {0}")]
    Invalid(String),
    #[error("Bridge ticket could not be signed: {0}")]
    Signing(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeTicket {
    /// Call record id.
    pub sub: Uuid,
    pub destination: String,
    pub caller_id: String,
    pub mode: OutboundMode,
    /// Announce the destination before dialing.
    pub whisper: bool,
    pub exp: usize,
}

impl BridgeTicket {
    pub fn new(
        call_record_id: Uuid,
        destination: &str,
        caller_id: &str,
        mode: OutboundMode,
        ttl: Duration,
    ) -> Self {
        let ttl = chrono::Duration::seconds(ttl.as_secs() as i64);
        Self {
            sub: call_record_id,
            destination: destination.to_string(),
            caller_id: caller_id.to_string(),
            whisper: mode == OutboundMode::Callback,
            mode,
            exp: (chrono::Utc::now() + ttl).timestamp() as usize,
        }
    }

    pub fn call_record_id(&self) -> Uuid {
        self.sub
    }

    pub fn sign(&self, secret: &str) -> Result<String, TicketError> {
        encode(&Header::default(), self, &EncodingKey::from_secret(secret.as_bytes()))
            .map_err(|e| TicketError::Signing(e.to_string()))
    }

    pub fn verify(token: &str, secret: &str) -> Result<Self, TicketError> {
        let mut validation = Validation::default();
        validation.leeway = 0;
        decode::<Self>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TicketError::Expired,
                _ => TicketError::Invalid(e.to_string()),
            })
    }
}
