use crate::app::AppState;
use crate::callstate::CallStateStore;
use crate::dispatch::WebhookUrls;
use crate::twilio::auth::verify_webhook;
use crate::twilio::InboundCallEvent;
use anyhow::Result;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tracing::{error, warn};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/twilio/voice", post(voice_webhook))
        .route("/twilio/voice/whisper", post(whisper_webhook))
        .route("/calls", get(list_calls))
        .route("/health", get(health))
}

async fn voice_webhook(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    match handle_voice(&state, &uri, &headers, &body).await {
        Ok(response) => response,
        Err(e) => {
            error!("error processing webhook: {}", e);
            internal_error(e)
        }
    }
}

async fn handle_voice(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
    body: &str,
) -> Result<Response> {
    let received_at = Utc::now();
    let url = webhook_url(state, headers, uri.path())?;

    if let Err(rejection) = verify_webhook(
        headers,
        body,
        &url,
        received_at,
        Utc::now(),
        state.config.twilio.auth_token.as_deref(),
    ) {
        warn!(%rejection, "rejected inbound webhook");
        return Ok(forbidden());
    }

    let event = InboundCallEvent::from_form_body(body);
    let urls = WebhookUrls {
        whisper_url: format!("{}/whisper", url),
        action_url: url,
    };
    let twiml = state.dispatcher.dispatch(&event, &urls).await;
    Ok(xml_response(twiml))
}

async fn whisper_webhook(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    match handle_whisper(&state, &uri, &headers, &body) {
        Ok(response) => response,
        Err(e) => {
            error!("error processing whisper webhook: {}", e);
            internal_error(e)
        }
    }
}

fn handle_whisper(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
    body: &str,
) -> Result<Response> {
    let received_at = Utc::now();
    let url = webhook_url(state, headers, uri.path())?;

    if let Err(rejection) = verify_webhook(
        headers,
        body,
        &url,
        received_at,
        Utc::now(),
        state.config.twilio.auth_token.as_deref(),
    ) {
        warn!(%rejection, "rejected whisper webhook");
        return Ok(forbidden());
    }

    let event = InboundCallEvent::from_form_body(body);
    Ok(xml_response(state.dispatcher.whisper_response(&event)))
}

async fn list_calls(State(state): State<AppState>) -> Response {
    let calls = serde_json::json!({
        "calls": state.store.snapshot().await.iter().map(|(call_sid, record)| {
            serde_json::json!({
                "call_sid": call_sid,
                "status": record.status,
                "started_at": record.started_at.to_rfc3339(),
                "original_caller": record.original_caller,
                "route": record.route,
            })
        }).collect::<Vec<_>>(),
    });
    Json(calls).into_response()
}

async fn health(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "ok",
        "version": crate::version::get_version_info(),
        "routing_enabled": state.config.routing.enabled,
        "active_calls": state.store.snapshot().await.len(),
    }))
    .into_response()
}

/// Reconstruct the public URL Twilio signed: the configured base when set,
/// else the Host header with an https scheme.
fn webhook_url(state: &AppState, headers: &HeaderMap, path: &str) -> Result<String> {
    if let Some(public) = &state.config.public_url {
        return Ok(format!("{}{}", public.trim_end_matches('/'), path));
    }
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| anyhow::anyhow!("request has no Host header"))?;
    Ok(format!("https://{}{}", host, path))
}

fn xml_response(twiml: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/xml")],
        twiml,
    )
        .into_response()
}

fn forbidden() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({"error": "Invalid Twilio request"})),
    )
        .into_response()
}

fn internal_error(e: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "Internal server error", "message": e.to_string()})),
    )
        .into_response()
}
