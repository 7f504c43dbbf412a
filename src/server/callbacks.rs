//! Callback URLs handed to the provider
//!
//! The provider keeps no application state, so every leg carries its
//! correlation ids (record id, conference name, leg role) in the query
//! string of the URLs it is given at creation time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Role a leg plays in a multi-leg call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegRole {
    /// The record's own single leg.
    Primary,
    /// Voice-AI side of a conference. Never drives the record.
    Agent,
    /// PSTN side of a conference. Ending it ends the conference.
    Pstn,
    /// Original caller parked while a transfer is consulted.
    Hold,
    /// Outbound leg to the transfer target before merge.
    Consult,
    /// Transfer target joined into the conference.
    Transferee,
    /// Caller sent back to the agent after a failed or canceled transfer.
    Reconnect,
    /// Caller handed off to an outside number.
    Forward,
}

impl LegRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            LegRole::Primary => "primary",
            LegRole::Agent => "agent",
            LegRole::Pstn => "pstn",
            LegRole::Hold => "hold",
            LegRole::Consult => "consult",
            LegRole::Transferee => "transferee",
            LegRole::Reconnect => "reconnect",
            LegRole::Forward => "forward",
        }
    }

    /// Whether callbacks for this leg describe the record they name.
    pub fn owns_record(&self) -> bool {
        !matches!(self, LegRole::Agent | LegRole::Consult)
    }

    /// Whether a `<Dial action>` on this leg reports the dialed party.
    /// Conference and SIP dials only say the leg left the dial.
    pub fn reports_dial_outcome(&self) -> bool {
        matches!(self, LegRole::Primary)
    }
}

impl fmt::Display for LegRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LegRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(LegRole::Primary),
            "agent" => Ok(LegRole::Agent),
            "pstn" => Ok(LegRole::Pstn),
            "hold" => Ok(LegRole::Hold),
            "consult" => Ok(LegRole::Consult),
            "transferee" => Ok(LegRole::Transferee),
            "reconnect" => Ok(LegRole::Reconnect),
            "forward" => Ok(LegRole::Forward),
            other => Err(format!("unknown leg role: {}", other)),
        }
    }
}

/// Correlation ids threaded through a callback URL.
#[derive(Debug, Clone, Default)]
pub struct CallbackParams<'a> {
    pub call_record_id: Option<Uuid>,
    pub conference: Option<&'a str>,
    pub leg: Option<LegRole>,
}

impl<'a> CallbackParams<'a> {
    pub fn record(id: Uuid) -> Self {
        Self { call_record_id: Some(id), ..Default::default() }
    }

    pub fn leg(mut self, leg: LegRole) -> Self {
        self.leg = Some(leg);
        self
    }

    pub fn conference(mut self, name: &'a str) -> Self {
        self.conference = Some(name);
        self
    }
}

#[derive(Debug, Clone)]
pub struct CallbackUrls {
    base: Url,
}

impl CallbackUrls {
    pub fn new(base: Url) -> Self {
        Self { base }
    }

    fn endpoint(&self, name: &str) -> Url {
        let mut url = self.base.clone();
        url.set_query(None);
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["webhooks", name]);
        }
        url
    }

    fn with_params(&self, name: &str, params: &CallbackParams<'_>) -> String {
        let mut url = self.endpoint(name);
        {
            let mut query = url.query_pairs_mut();
            if let Some(id) = params.call_record_id {
                query.append_pair("call_record_id", &id.to_string());
            }
            if let Some(conf) = params.conference {
                query.append_pair("conf", conf);
            }
            if let Some(leg) = params.leg {
                query.append_pair("leg", leg.as_str());
            }
        }
        url.to_string()
    }

    /// Plain per-leg status callback.
    pub fn call_status(&self, params: &CallbackParams<'_>) -> String {
        self.with_params("call-status", params)
    }

    /// `<Dial action>` target.
    pub fn dial_action(&self, params: &CallbackParams<'_>) -> String {
        self.with_params("dial-action", params)
    }

    /// Conference document for one participant.
    pub fn conference(&self, params: &CallbackParams<'_>) -> String {
        self.with_params("conference", params)
    }

    /// Conference start/end and participant join/leave notifications.
    pub fn conference_events(&self, params: &CallbackParams<'_>) -> String {
        self.with_params("conference-events", params)
    }

    pub fn recording(&self, call_record_id: Uuid) -> String {
        self.with_params("recording", &CallbackParams::record(call_record_id))
    }

    pub fn bridge(&self, ticket: &str) -> String {
        self.with_ticket("bridge", ticket)
    }

    /// Document dialing the outside number of a cold transfer.
    pub fn forward(&self, ticket: &str) -> String {
        self.with_ticket("forward", ticket)
    }

    fn with_ticket(&self, name: &str, ticket: &str) -> String {
        let mut url = self.endpoint(name);
        url.query_pairs_mut().append_pair("ticket", ticket);
        url.to_string()
    }
}
