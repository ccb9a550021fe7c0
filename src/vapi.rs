use crate::config::VapiConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum VapiError {
    #[error("vapi api key not configured")]
    NotConfigured,
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("vapi returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed vapi response: {0}")]
    Malformed(String),
}

/// A started voice-agent session: the TwiML Vapi wants relayed to Twilio,
/// plus Vapi's id for the session.
#[derive(Debug, Clone)]
pub struct SessionStart {
    pub twiml: String,
    pub session_id: String,
}

/// Contract to the voice-AI backend. A trait so the dispatcher can be
/// exercised against a mock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoiceAgent: Send + Sync {
    /// Start an AI-driven leg for an in-progress provider call. Any
    /// transport or non-2xx failure surfaces as a [`VapiError`]; the caller
    /// decides the fallback.
    async fn start_session(
        &self,
        caller: &str,
        called: &str,
        assistant_id: Option<String>,
    ) -> Result<SessionStart, VapiError>;

    /// End the session attached to a provider call id. Callers should go
    /// through [`end_session_detached`] unless they need the outcome.
    async fn end_session(&self, call_sid: &str) -> Result<(), VapiError>;
}

/// Best-effort session teardown: spawned off the request path, failure goes
/// to the log and nowhere else. Ending a session must never break the
/// webhook response.
pub fn end_session_detached(agent: Arc<dyn VoiceAgent>, call_sid: String) {
    tokio::spawn(async move {
        match agent.end_session(&call_sid).await {
            Ok(()) => info!(call_sid = %call_sid, "voice agent session ended"),
            Err(e) => warn!(call_sid = %call_sid, "failed to end voice agent session: {}", e),
        }
    });
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartCallPayload<'a> {
    phone_call_provider_bypass_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone_number_id: Option<&'a str>,
    customer: Customer<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    assistant_id: Option<&'a str>,
}

#[derive(Serialize)]
struct Customer<'a> {
    number: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartCallResponse {
    id: String,
    phone_call_provider_details: Option<ProviderDetails>,
}

#[derive(Deserialize)]
struct ProviderDetails {
    twiml: Option<String>,
}

/// Vapi HTTP client.
pub struct VapiClient {
    endpoint: String,
    api_key: Option<String>,
    phone_number_id: Option<String>,
    client: reqwest::Client,
}

impl VapiClient {
    pub fn new(config: &VapiConfig) -> Self {
        let timeout = Duration::from_millis(config.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
        Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            phone_number_id: config.phone_number_id.clone(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    fn bearer(&self) -> Result<&str, VapiError> {
        self.api_key.as_deref().ok_or(VapiError::NotConfigured)
    }
}

#[async_trait]
impl VoiceAgent for VapiClient {
    async fn start_session(
        &self,
        caller: &str,
        called: &str,
        assistant_id: Option<String>,
    ) -> Result<SessionStart, VapiError> {
        let payload = StartCallPayload {
            phone_call_provider_bypass_enabled: true,
            phone_number_id: self.phone_number_id.as_deref(),
            customer: Customer { number: caller },
            assistant_id: assistant_id.as_deref(),
        };

        let response = self
            .client
            .post(format!("{}/call", self.endpoint))
            .bearer_auth(self.bearer()?)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(caller, called, status = status.as_u16(), body = %body, "vapi call start failed");
            return Err(VapiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: StartCallResponse = response.json().await?;
        let twiml = parsed
            .phone_call_provider_details
            .and_then(|d| d.twiml)
            .ok_or_else(|| {
                VapiError::Malformed("response missing phoneCallProviderDetails.twiml".to_string())
            })?;

        info!(caller, called, session_id = %parsed.id, "voice agent session started");
        Ok(SessionStart {
            twiml,
            session_id: parsed.id,
        })
    }

    async fn end_session(&self, call_sid: &str) -> Result<(), VapiError> {
        let response = self
            .client
            .post(format!("{}/call/{}/end", self.endpoint, call_sid))
            .bearer_auth(self.bearer()?)
            .json(&serde_json::json!({}))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(VapiError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}
