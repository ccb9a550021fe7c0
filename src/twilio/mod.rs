use std::collections::HashMap;

pub mod auth;
pub mod twiml;

/// Lifecycle status reported in the `CallStatus` form field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStatus {
    Ringing,
    Answered,
    Completed,
    InProgress,
    Other(String),
}

impl From<&str> for CallStatus {
    fn from(s: &str) -> Self {
        match s {
            "ringing" => CallStatus::Ringing,
            "answered" => CallStatus::Answered,
            "completed" => CallStatus::Completed,
            "in-progress" => CallStatus::InProgress,
            other => CallStatus::Other(other.to_string()),
        }
    }
}

impl CallStatus {
    pub fn as_str(&self) -> &str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Answered => "answered",
            CallStatus::Completed => "completed",
            CallStatus::InProgress => "in-progress",
            CallStatus::Other(s) => s,
        }
    }
}

/// Outcome of a `<Dial>` attempt, reported in `DialCallStatus` on the
/// action callback of a forwarded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialOutcome {
    Answered,
    NoAnswer,
    Busy,
    Failed,
    Other(String),
}

impl From<&str> for DialOutcome {
    fn from(s: &str) -> Self {
        match s {
            "answered" => DialOutcome::Answered,
            "no-answer" => DialOutcome::NoAnswer,
            "busy" => DialOutcome::Busy,
            "failed" => DialOutcome::Failed,
            other => DialOutcome::Other(other.to_string()),
        }
    }
}

/// One parsed webhook payload. Built once per request, immutable afterwards.
#[derive(Debug, Clone)]
pub struct InboundCallEvent {
    pub account_sid: String,
    pub call_sid: String,
    pub call_status: CallStatus,
    pub dial_call_status: Option<DialOutcome>,
    pub from: String,
    pub to: String,
    pub call_duration: Option<u64>,
}

impl InboundCallEvent {
    /// Parse a form-urlencoded webhook body. Missing fields degrade to
    /// empty strings rather than failing; the authenticator has already
    /// rejected bodies without the core identifiers.
    pub fn from_form_body(body: &str) -> Self {
        let params: HashMap<String, String> =
            url::form_urlencoded::parse(body.as_bytes()).into_owned().collect();

        let field = |name: &str| params.get(name).cloned().unwrap_or_default();

        Self {
            account_sid: field("AccountSid"),
            call_sid: field("CallSid"),
            call_status: CallStatus::from(field("CallStatus").as_str()),
            dial_call_status: params
                .get("DialCallStatus")
                .map(|s| DialOutcome::from(s.as_str())),
            from: field("From"),
            to: field("To"),
            call_duration: params.get("CallDuration").and_then(|s| s.parse().ok()),
        }
    }
}
