//! SignalWire LaML (Twilio-compatible) REST client

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::server::config::SignalWireConfig;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
}

/// Parameters for a new outbound leg.
#[derive(Debug, Clone)]
pub struct OriginateRequest {
    pub to: String,
    pub from: String,
    /// Control document the provider fetches once the leg answers.
    pub url: String,
    pub status_callback: String,
    pub timeout_secs: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OriginatedCall {
    pub sid: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Call-control operations the handlers depend on.
#[async_trait]
pub trait TelephonyProvider: Send + Sync {
    async fn originate(&self, request: &OriginateRequest) -> Result<OriginatedCall, ProviderError>;
    /// Ask the provider to end a live call.
    async fn terminate(&self, call_sid: &str) -> Result<(), ProviderError>;
    /// Point a live call at a new control document.
    async fn redirect(&self, call_sid: &str, url: &str) -> Result<(), ProviderError>;
    /// Carrier and format data for a number.
    async fn lookup(&self, phone_number: &str) -> Result<NumberLookup, ProviderError>;
}

#[derive(Clone)]
pub struct SignalWireClient {
    client: Client,
    project_id: String,
    api_token: String,
    /// `https://<space>`
    space_base: String,
    /// `https://<space>/api/laml/2010-04-01/Accounts/<project>`
    laml_base: String,
}

impl SignalWireClient {
    pub fn new(config: &SignalWireConfig) -> Self {
        let space = config
            .space_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        Self::with_base_url(
            &format!("https://{}", space),
            config.project_id.clone(),
            config.api_token.clone(),
        )
    }

    /// Point the client at another host, e.g. a mock server.
    pub fn with_base_url(space_base: &str, project_id: String, api_token: String) -> Self {
        let space_base = space_base.trim_end_matches('/').to_string();
        let laml_base = format!("{}/api/laml/2010-04-01/Accounts/{}", space_base, project_id);
        Self {
            client: Client::new(),
            project_id,
            api_token,
            space_base,
            laml_base,
        }
    }

    async fn send<R: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<R, ProviderError> {
        let response = request
            .basic_auth(&self.project_id, Some(&self.api_token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status: status.as_u16(), message });
        }

        Ok(response.json().await?)
    }

    async fn post_form<R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<R, ProviderError> {
        self.send(self.client.post(format!("{}{}", self.laml_base, path)).form(form))
            .await
    }

    /// Originate an outbound call
    pub async fn create_call(&self, request: &OriginateRequest) -> Result<OriginatedCall, ProviderError> {
        let timeout = request.timeout_secs.map(|t| t.to_string());
        let mut form: Vec<(&str, &str)> = vec![
            ("To", request.to.as_str()),
            ("From", request.from.as_str()),
            ("Url", request.url.as_str()),
            ("Method", "POST"),
            ("StatusCallback", request.status_callback.as_str()),
            ("StatusCallbackMethod", "POST"),
            ("StatusCallbackEvent", "initiated"),
            ("StatusCallbackEvent", "ringing"),
            ("StatusCallbackEvent", "answered"),
            ("StatusCallbackEvent", "completed"),
        ];
        if let Some(timeout) = timeout.as_deref() {
            form.push(("Timeout", timeout));
        }

        self.post_form("/Calls.json", &form).await
    }

    /// End a live call
    pub async fn complete_call(&self, call_sid: &str) -> Result<(), ProviderError> {
        let _: serde_json::Value = self
            .post_form(&format!("/Calls/{}.json", call_sid), &[("Status", "completed")])
            .await?;
        Ok(())
    }

    /// Send a live call to a new control document
    pub async fn update_call_url(&self, call_sid: &str, url: &str) -> Result<(), ProviderError> {
        let _: serde_json::Value = self
            .post_form(&format!("/Calls/{}.json", call_sid), &[("Url", url), ("Method", "POST")])
            .await?;
        Ok(())
    }

    /// Carrier and format data for a number
    pub async fn lookup_number(&self, phone_number: &str) -> Result<NumberLookup, ProviderError> {
        self.send(
            self.client
                .get(format!(
                    "{}/api/relay/rest/lookup/phone_number/{}",
                    self.space_base, phone_number
                ))
                .query(&[("include", "carrier")]),
        )
        .await
    }
}

#[async_trait]
impl TelephonyProvider for SignalWireClient {
    async fn originate(&self, request: &OriginateRequest) -> Result<OriginatedCall, ProviderError> {
        self.create_call(request).await
    }

    async fn terminate(&self, call_sid: &str) -> Result<(), ProviderError> {
        self.complete_call(call_sid).await
    }

    async fn redirect(&self, call_sid: &str, url: &str) -> Result<(), ProviderError> {
        self.update_call_url(call_sid, url).await
    }

    async fn lookup(&self, phone_number: &str) -> Result<NumberLookup, ProviderError> {
        self.lookup_number(phone_number).await
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NumberLookup {
    pub e164: Option<String>,
    pub national_number_formatted: Option<String>,
    #[serde(default)]
    pub carrier: Option<Carrier>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Carrier {
    pub lec: Option<String>,
    pub linetype: Option<String>,
}

// Webhook payloads

/// Form body of every status callback, dial action and recording callback.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallbackForm {
    pub call_sid: Option<String>,
    pub call_status: Option<String>,
    pub call_duration: Option<String>,
    pub dial_call_sid: Option<String>,
    pub dial_call_status: Option<String>,
    pub dial_call_duration: Option<String>,
    pub to: Option<String>,
    pub from: Option<String>,
    pub direction: Option<String>,
    pub timestamp: Option<String>,
    pub recording_url: Option<String>,
    pub recording_sid: Option<String>,
}

impl CallbackForm {
    /// Status and duration of the leg this callback describes. With
    /// `include_dial`, a non-empty `DialCallStatus` supersedes the parent's
    /// own `CallStatus`, and the dial duration goes with it.
    pub fn observation(&self, include_dial: bool) -> (Option<&str>, Option<i32>) {
        let (status, duration) = if include_dial && non_empty(&self.dial_call_status) {
            (self.dial_call_status.as_deref(), self.dial_call_duration.as_deref())
        } else {
            (
                self.call_status.as_deref().filter(|s| !s.trim().is_empty()),
                self.call_duration.as_deref(),
            )
        };
        (status.map(str::trim), duration.and_then(|d| d.trim().parse().ok()))
    }
}

/// Form body of a conference status callback.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConferenceEventForm {
    pub status_callback_event: Option<String>,
    pub conference_sid: Option<String>,
    pub friendly_name: Option<String>,
    pub call_sid: Option<String>,
}

/// Form body of the inbound voice webhook.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InboundCallForm {
    pub call_sid: Option<String>,
    pub to: Option<String>,
    pub from: Option<String>,
    pub call_status: Option<String>,
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false)
}
