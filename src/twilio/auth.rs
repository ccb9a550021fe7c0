use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use http::header::{CONTENT_TYPE, USER_AGENT};
use http::HeaderMap;
use once_cell::sync::Lazy;
use regex::Regex;
use sha1::Sha1;
use std::collections::HashMap;
use tracing::{info, warn};

type HmacSha1 = Hmac<Sha1>;

const IDEMPOTENCY_TOKEN_HEADER: &str = "i-twilio-idempotency-token";
const SIGNATURE_HEADER: &str = "x-twilio-signature";
const PROXY_PREFIX: &str = "TwilioProxy/";
const MAX_REQUEST_AGE_SECS: i64 = 300;

static ACCOUNT_SID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^AC[a-zA-Z0-9]{32}$").unwrap());
static CALL_SID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^CA[a-zA-Z0-9]{32}$").unwrap());

/// Why a webhook was rejected as not coming from Twilio.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthRejection {
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),
    #[error("unexpected user agent: {0:?}")]
    InvalidUserAgent(String),
    #[error("unexpected content type: {0:?}")]
    InvalidContentType(String),
    #[error("missing required parameter: {0}")]
    MissingParam(&'static str),
    #[error("invalid AccountSid format: {0:?}")]
    InvalidAccountSid(String),
    #[error("invalid CallSid format: {0:?}")]
    InvalidCallSid(String),
    #[error("request too old: {0}s, max {MAX_REQUEST_AGE_SECS}s")]
    StaleRequest(i64),
}

/// Layered authenticity check for an inbound Twilio webhook.
///
/// Every layer except the signature must pass: required headers,
/// `TwilioProxy/` user agent, form-urlencoded content type, presence and
/// format of `AccountSid`/`CallSid`, and request age within the replay
/// window. The cryptographic signature is verified last when an auth token
/// is configured, but its outcome is only logged; upstream proxies rewrite
/// requests in ways that break signature computation, so a mismatch does
/// not reject.
///
/// Pure with respect to its arguments so it can be driven with synthetic
/// fixtures.
pub fn verify_webhook(
    headers: &HeaderMap,
    body: &str,
    url: &str,
    request_time: DateTime<Utc>,
    now: DateTime<Utc>,
    auth_token: Option<&str>,
) -> Result<(), AuthRejection> {
    for name in [
        USER_AGENT.as_str(),
        IDEMPOTENCY_TOKEN_HEADER,
        SIGNATURE_HEADER,
    ] {
        if !headers.contains_key(name) {
            return Err(AuthRejection::MissingHeader(match name {
                "user-agent" => "User-Agent",
                IDEMPOTENCY_TOKEN_HEADER => "I-Twilio-Idempotency-Token",
                _ => "X-Twilio-Signature",
            }));
        }
    }

    let user_agent = header_str(headers, USER_AGENT.as_str());
    if !user_agent.starts_with(PROXY_PREFIX) {
        return Err(AuthRejection::InvalidUserAgent(user_agent.to_string()));
    }

    let content_type = header_str(headers, CONTENT_TYPE.as_str());
    if !content_type.contains("application/x-www-form-urlencoded") {
        return Err(AuthRejection::InvalidContentType(content_type.to_string()));
    }

    let params: HashMap<String, String> =
        url::form_urlencoded::parse(body.as_bytes()).into_owned().collect();

    let account_sid = params
        .get("AccountSid")
        .ok_or(AuthRejection::MissingParam("AccountSid"))?;
    let call_sid = params
        .get("CallSid")
        .ok_or(AuthRejection::MissingParam("CallSid"))?;

    if !ACCOUNT_SID_RE.is_match(account_sid) {
        return Err(AuthRejection::InvalidAccountSid(account_sid.clone()));
    }
    if !CALL_SID_RE.is_match(call_sid) {
        return Err(AuthRejection::InvalidCallSid(call_sid.clone()));
    }

    let age_secs = (now - request_time).num_seconds().abs();
    if age_secs > MAX_REQUEST_AGE_SECS {
        return Err(AuthRejection::StaleRequest(age_secs));
    }

    // Signature check is advisory only; see module docs.
    let signature = header_str(headers, SIGNATURE_HEADER);
    if let Some(token) = auth_token {
        if !signature.is_empty() {
            let expected = compute_signature(token, url, &params);
            if constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
                info!(call_sid = %call_sid, "signature check passed");
            } else {
                warn!(call_sid = %call_sid, url, "signature check failed (non-blocking)");
            }
        }
    }

    Ok(())
}

/// Twilio request signature: base64(HMAC-SHA1(url + params sorted by key
/// with key and value concatenated, auth token)).
pub fn compute_signature(auth_token: &str, url: &str, params: &HashMap<String, String>) -> String {
    let mut keys: Vec<&String> = params.keys().collect();
    keys.sort();

    let mut data = url.to_string();
    for key in keys {
        data.push_str(key);
        data.push_str(&params[key]);
    }

    let mut mac =
        HmacSha1::new_from_slice(auth_token.as_bytes()).expect("hmac accepts any key length");
    mac.update(data.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
