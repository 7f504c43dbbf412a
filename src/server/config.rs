//! Service configuration
//!
//! Read once at startup from the environment. Missing or malformed values
//! stop the process before it binds a port.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use url::Url;

/// Upper bound for the legacy correlation window and the bridge ticket TTL.
pub const MAX_WINDOW_SECS: u64 = 86_400;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Numbers and endpoints the call flows route through.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Voice-AI trunk number. Agent legs dial `sip:<system_number>@<sip_domain>`.
    pub system_number: String,
    /// Caller id used when the request names none.
    pub default_caller_id: String,
    pub voice_ai_sip_domain: String,
    pub hold_music_url: Option<String>,
}

impl RoutingConfig {
    /// SIP URI that reaches the voice-AI agent through the system number.
    pub fn agent_sip_uri(&self) -> String {
        format!("sip:{}@{}", self.system_number, self.voice_ai_sip_domain)
    }

    /// Dispatch-rule URI used when per-call registration is unavailable.
    pub fn dispatch_sip_uri(&self, to: &str) -> String {
        format!("sip:{}@{};transport=tls", to, self.voice_ai_sip_domain)
    }

    /// Whether dialing `number` would loop back into the voice-AI trunk.
    pub fn is_system_number(&self, number: &str) -> bool {
        digits(number) == digits(&self.system_number)
    }
}

fn digits(number: &str) -> String {
    number.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[derive(Debug, Clone)]
pub struct SignalWireConfig {
    pub project_id: String,
    pub api_token: String,
    /// Space host, e.g. `example.signalwire.com`.
    pub space_url: String,
}

#[derive(Debug, Clone)]
pub struct VoiceAiConfig {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// `None` disables the background sweeper.
    pub sweep_interval: Option<Duration>,
    pub chunk_size: usize,
    pub call_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    /// Absolute base the provider uses to reach this service.
    pub public_base_url: Url,
    pub signalwire: SignalWireConfig,
    pub voice_ai: VoiceAiConfig,
    pub jwt_secret: String,
    pub bridge_ticket_secret: String,
    pub bridge_ticket_ttl: Duration,
    /// Legacy phone-number correlation window. `None` keeps it off.
    pub legacy_correlation_window: Option<Duration>,
    pub routing: RoutingConfig,
    pub batch: BatchConfig,
}

impl AppConfig {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Create config from any variable lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| -> Result<String, ConfigError> {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(name))
        };

        let public_base_url = {
            let raw = required("PUBLIC_BASE_URL")?;
            let url = Url::parse(&raw).map_err(|e| ConfigError::Invalid {
                name: "PUBLIC_BASE_URL",
                reason: e.to_string(),
            })?;
            if url.cannot_be_a_base() {
                return Err(ConfigError::Invalid {
                    name: "PUBLIC_BASE_URL",
                    reason: "not an absolute base URL".to_string(),
                });
            }
            url
        };

        let sweep_secs: u64 = parse_or(&lookup, "BATCH_SWEEP_INTERVAL_SECS", 30)?;
        let chunk_size: usize = parse_or(&lookup, "BATCH_CHUNK_SIZE", 5)?;
        if chunk_size == 0 {
            return Err(ConfigError::Invalid {
                name: "BATCH_CHUNK_SIZE",
                reason: "must be at least 1".to_string(),
            });
        }

        let legacy_window = match lookup("LEGACY_CORRELATION_WINDOW_SECS") {
            Some(raw) if !raw.trim().is_empty() => Some(Duration::from_secs(at_most(
                "LEGACY_CORRELATION_WINDOW_SECS",
                parse_value("LEGACY_CORRELATION_WINDOW_SECS", &raw)?,
                MAX_WINDOW_SECS,
            )?)),
            _ => None,
        };
        let ticket_ttl = at_most(
            "BRIDGE_TICKET_TTL_SECS",
            parse_or(&lookup, "BRIDGE_TICKET_TTL_SECS", 300)?,
            MAX_WINDOW_SECS,
        )?;

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            port: parse_or(&lookup, "PORT", 3000)?,
            public_base_url,
            signalwire: SignalWireConfig {
                project_id: required("SIGNALWIRE_PROJECT_ID")?,
                api_token: required("SIGNALWIRE_API_TOKEN")?,
                space_url: required("SIGNALWIRE_SPACE_URL")?,
            },
            voice_ai: VoiceAiConfig {
                api_key: required("VOICE_AI_API_KEY")?,
                base_url: lookup("VOICE_AI_BASE_URL")
                    .filter(|v| !v.trim().is_empty())
                    .unwrap_or_else(|| "https://api.retellai.com".to_string()),
            },
            jwt_secret: required("JWT_SECRET")?,
            bridge_ticket_secret: required("BRIDGE_TICKET_SECRET")?,
            bridge_ticket_ttl: Duration::from_secs(ticket_ttl),
            legacy_correlation_window: legacy_window,
            routing: RoutingConfig {
                system_number: required("SYSTEM_NUMBER")?,
                default_caller_id: required("DEFAULT_CALLER_ID")?,
                voice_ai_sip_domain: required("VOICE_AI_SIP_DOMAIN")?,
                hold_music_url: lookup("HOLD_MUSIC_URL").filter(|v| !v.trim().is_empty()),
            },
            batch: BatchConfig {
                sweep_interval: (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs)),
                chunk_size,
                call_delay: Duration::from_millis(parse_or(&lookup, "BATCH_CALL_DELAY_MS", 2000)?),
            },
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => parse_value(name, &raw),
        _ => Ok(default),
    }
}

fn at_most(name: &'static str, value: u64, max: u64) -> Result<u64, ConfigError> {
    if value > max {
        return Err(ConfigError::Invalid {
            name,
            reason: format!("must be at most {}", max),
        });
    }
    Ok(value)
}

fn parse_value<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })
}
