use anyhow::Error;
use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long, default_value = "voicebridge.toml")]
    pub conf: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub http_addr: String,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    /// External base URL of this service, e.g. "https://voice.example.com".
    /// When unset, webhook URLs are reconstructed from the Host header.
    pub public_url: Option<String>,
    pub routing: RoutingConfig,
    pub vapi: VapiConfig,
    pub twilio: TwilioConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RoutingConfig {
    pub enabled: bool,
    /// JSON object mapping a called number to its route policy, e.g.
    /// `{"+15551234567": {"targetNumber": "+15034688103"}}`. Kept as a raw
    /// string so a malformed map degrades to "no routing" instead of failing
    /// config load.
    pub map: Option<String>,
    /// Default ring time for forwarded calls, in seconds.
    pub default_forward_timeout: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VapiConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    /// Assistant used when a route policy does not name one.
    pub assistant_id: Option<String>,
    /// Vapi phone number id sent in the start-call payload.
    pub phone_number_id: Option<String>,
    /// Transfer unanswered forwarded calls to the assistant.
    pub fallback_enabled: bool,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TwilioConfig {
    /// Auth token used for the (non-blocking) signature check.
    pub auth_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            log_level: Some("info".to_string()),
            log_file: None,
            public_url: None,
            routing: RoutingConfig::default(),
            vapi: VapiConfig::default(),
            twilio: TwilioConfig::default(),
        }
    }
}

impl Default for VapiConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.vapi.ai".to_string(),
            api_key: None,
            assistant_id: None,
            phone_number_id: None,
            fallback_enabled: false,
            timeout_ms: None,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let mut config: Config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables override file values, matching the deployment
    /// surface of the hosted relay.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PHONE_ROUTING_ENABLED") {
            self.routing.enabled = v == "true";
        }
        if let Ok(v) = std::env::var("PHONE_ROUTING_MAP") {
            self.routing.map = Some(v);
        }
        if let Ok(v) = std::env::var("DEFAULT_FORWARD_TIMEOUT") {
            if let Ok(secs) = v.parse() {
                self.routing.default_forward_timeout = Some(secs);
            }
        }
        if let Ok(v) = std::env::var("VAPI_ENDPOINT") {
            self.vapi.endpoint = v;
        }
        if let Ok(v) = std::env::var("VAPI_API_KEY") {
            self.vapi.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("VAPI_ASSISTANT_ID") {
            self.vapi.assistant_id = Some(v);
        }
        if let Ok(v) = std::env::var("VAPI_PHONE_NUMBER_ID") {
            self.vapi.phone_number_id = Some(v);
        }
        if let Ok(v) = std::env::var("VAPI_FALLBACK_ENABLED") {
            self.vapi.fallback_enabled = v == "true";
        }
        if let Ok(v) = std::env::var("TWILIO_AUTH_TOKEN") {
            self.twilio.auth_token = Some(v);
        }
        if let Ok(v) = std::env::var("PUBLIC_URL") {
            self.public_url = Some(v);
        }
    }
}
