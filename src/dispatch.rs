use crate::callstate::{CallProgress, CallRecord, CallStateStore};
use crate::routing::RoutingDirectory;
use crate::twilio::twiml::{empty_response, DialNumber, TwimlBuilder};
use crate::twilio::{CallStatus, DialOutcome, InboundCallEvent};
use crate::vapi::{end_session_detached, VoiceAgent};
use std::sync::Arc;
use tracing::{debug, error, info};

const UNAVAILABLE_MESSAGE: &str = "I'm sorry, but no one is available to take your call right now. Please hold while I connect you to our AI assistant who can help you.";
const START_FAILED_MESSAGE: &str =
    "Sorry, we're experiencing technical difficulties. Please try again later.";
const TRANSFER_FAILED_MESSAGE: &str =
    "I apologize, but we're experiencing technical difficulties. Please try calling again later.";

/// Callback URLs for the current request, reconstructed by the HTTP layer.
#[derive(Debug, Clone)]
pub struct WebhookUrls {
    /// The voice webhook itself; used as the `<Dial>` action callback.
    pub action_url: String,
    /// The whisper sub-endpoint, announced to the answering party.
    pub whisper_url: String,
}

/// The call-routing state machine. Given a validated, parsed webhook event,
/// decides the next instruction and produces the TwiML reply, consulting the
/// routing directory and call-state store and invoking the voice agent as
/// needed. Always returns well-formed TwiML; upstream failures are folded
/// into spoken fallbacks here, never surfaced as HTTP errors.
pub struct CallEventDispatcher {
    directory: RoutingDirectory,
    store: Arc<dyn CallStateStore>,
    agent: Arc<dyn VoiceAgent>,
    fallback_enabled: bool,
    default_assistant_id: Option<String>,
}

impl CallEventDispatcher {
    pub fn new(
        directory: RoutingDirectory,
        store: Arc<dyn CallStateStore>,
        agent: Arc<dyn VoiceAgent>,
        fallback_enabled: bool,
        default_assistant_id: Option<String>,
    ) -> Self {
        Self {
            directory,
            store,
            agent,
            fallback_enabled,
            default_assistant_id,
        }
    }

    pub async fn dispatch(&self, event: &InboundCallEvent, urls: &WebhookUrls) -> String {
        // Dial-status callbacks carry a CallStatus too; the outcome wins.
        if event.dial_call_status.is_some() {
            return self.handle_dial_status(event).await;
        }

        match event.call_status {
            CallStatus::Ringing => self.handle_incoming(event, urls).await,
            CallStatus::Answered => {
                self.log_call_event(event, "answered");
                empty_response()
            }
            CallStatus::Completed => self.handle_completed(event).await,
            _ => empty_response(),
        }
    }

    async fn handle_incoming(&self, event: &InboundCallEvent, urls: &WebhookUrls) -> String {
        info!(
            call_sid = %event.call_sid,
            from = %event.from,
            to = %event.to,
            "incoming call"
        );

        match self.directory.resolve_by_called_number(&event.to) {
            Some(route) => match route.target_number.clone() {
                Some(target) => self.forward_call(event, route, target, urls).await,
                None => {
                    let assistant = route.assistant_id.clone();
                    self.start_agent_session(event, assistant, START_FAILED_MESSAGE).await
                }
            },
            None => {
                debug!(to = %event.to, "no routing configuration, using voice agent directly");
                self.start_agent_session(
                    event,
                    self.default_assistant_id.clone(),
                    START_FAILED_MESSAGE,
                )
                .await
            }
        }
    }

    async fn forward_call(
        &self,
        event: &InboundCallEvent,
        route: crate::routing::ResolvedRoute,
        target: String,
        urls: &WebhookUrls,
    ) -> String {
        let timeout_secs = route.max_ring_time_ms / 1000;
        info!(
            call_sid = %event.call_sid,
            target = %target,
            timeout_secs,
            "forwarding call"
        );

        self.store
            .insert(
                event.call_sid.clone(),
                CallRecord::forwarding(route, event.from.clone()),
            )
            .await;

        TwimlBuilder::new()
            .dial(&DialNumber {
                number: target,
                timeout_secs,
                action_url: urls.action_url.clone(),
                whisper_url: urls.whisper_url.clone(),
                caller_id: event.from.clone(),
            })
            .say(UNAVAILABLE_MESSAGE)
            .build()
    }

    async fn handle_dial_status(&self, event: &InboundCallEvent) -> String {
        let outcome = match &event.dial_call_status {
            Some(outcome) => outcome,
            None => return empty_response(),
        };

        let record = match self.store.get(&event.call_sid).await {
            Some(record) => record,
            None => {
                debug!(call_sid = %event.call_sid, "no call record for dial status callback");
                return empty_response();
            }
        };

        match outcome {
            DialOutcome::Answered => {
                info!(call_sid = %event.call_sid, "forwarded call answered by target");
                self.store
                    .set_status(&event.call_sid, CallProgress::Answered)
                    .await;
                empty_response()
            }
            DialOutcome::NoAnswer | DialOutcome::Busy | DialOutcome::Failed => {
                info!(
                    call_sid = %event.call_sid,
                    outcome = ?outcome,
                    "forwarded call not answered"
                );
                if !self.fallback_enabled {
                    info!(call_sid = %event.call_sid, "voice agent fallback disabled, ending call");
                    return TwimlBuilder::new().hangup().build();
                }

                let assistant = record.route.assistant_id.clone();
                match self.agent.start_session(&event.from, &event.to, assistant).await {
                    Ok(session) => {
                        self.store
                            .set_status(&event.call_sid, CallProgress::TransferredToVoiceAgent)
                            .await;
                        session.twiml
                    }
                    Err(e) => {
                        error!(call_sid = %event.call_sid, "failed to transfer to voice agent: {}", e);
                        TwimlBuilder::new().say(TRANSFER_FAILED_MESSAGE).hangup().build()
                    }
                }
            }
            DialOutcome::Other(status) => {
                debug!(call_sid = %event.call_sid, status = %status, "unknown dial status");
                empty_response()
            }
        }
    }

    async fn handle_completed(&self, event: &InboundCallEvent) -> String {
        self.log_call_event(event, "completed");
        end_session_detached(self.agent.clone(), event.call_sid.clone());
        if self.store.remove(&event.call_sid).await.is_some() {
            info!(call_sid = %event.call_sid, "cleaned up call record");
        }
        empty_response()
    }

    async fn start_agent_session(
        &self,
        event: &InboundCallEvent,
        assistant_id: Option<String>,
        failure_message: &str,
    ) -> String {
        match self
            .agent
            .start_session(&event.from, &event.to, assistant_id)
            .await
        {
            Ok(session) => session.twiml,
            Err(e) => {
                error!(call_sid = %event.call_sid, "failed to start voice agent session: {}", e);
                TwimlBuilder::new().say(failure_message).hangup().build()
            }
        }
    }

    /// Whisper announcement, played to the forwarding target before the legs
    /// bridge. Bypasses the state machine: on this leg the called number is
    /// the forwarding destination, so the policy is reverse-resolved. Always
    /// produces valid TwiML, even with incomplete caller data.
    pub fn whisper_response(&self, event: &InboundCallEvent) -> String {
        let route = self.directory.resolve_by_target_number(&event.to);
        let message = route
            .as_ref()
            .and_then(|r| {
                r.whisper_message.clone().or_else(|| {
                    r.description
                        .as_ref()
                        .map(|d| format!("{}: Call from {}", d, event.from))
                })
            })
            .unwrap_or_else(|| {
                format!(
                    "Business call forwarded from {} - caller {}",
                    event.to, event.from
                )
            });

        info!(to = %event.to, message = %message, "whisper announcement");
        TwimlBuilder::new().say(&message).build()
    }

    fn log_call_event(&self, event: &InboundCallEvent, what: &str) {
        info!(
            call_sid = %event.call_sid,
            from = %event.from,
            to = %event.to,
            duration = ?event.call_duration,
            "call {}",
            what
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callstate::MemoryCallStateStore;
    use crate::config::{RoutingConfig, VapiConfig};
    use crate::vapi::{MockVoiceAgent, SessionStart, VapiError};

    const AGENT_TWIML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Response><Connect><Stream url=\"wss://stream.vapi.ai/call_123\"/></Connect></Response>";

    const MAP: &str = r#"{
        "+14805767537": {"vapiAssistantId": "main-business-assistant"},
        "+15551234567": {
            "targetNumber": "+15034688103",
            "maxRingTime": 30000,
            "vapiAssistantId": "owner-assistant",
            "description": "Owner line"
        }
    }"#;

    fn directory(enabled: bool, map: Option<&str>) -> RoutingDirectory {
        RoutingDirectory::from_config(
            &RoutingConfig {
                enabled,
                map: map.map(|s| s.to_string()),
                default_forward_timeout: None,
            },
            &VapiConfig {
                assistant_id: Some("default-assistant-id".to_string()),
                ..Default::default()
            },
        )
    }

    fn urls() -> WebhookUrls {
        WebhookUrls {
            action_url: "https://api.example.com/twilio/voice".to_string(),
            whisper_url: "https://api.example.com/twilio/voice/whisper".to_string(),
        }
    }

    fn event(call_status: &str, to: &str) -> InboundCallEvent {
        InboundCallEvent {
            account_sid: "AC0123456789abcdef0123456789abcdef".to_string(),
            call_sid: "CA0123456789abcdef0123456789abcdef".to_string(),
            call_status: CallStatus::from(call_status),
            dial_call_status: None,
            from: "+15559876543".to_string(),
            to: to.to_string(),
            call_duration: None,
        }
    }

    fn dial_event(outcome: &str, to: &str) -> InboundCallEvent {
        InboundCallEvent {
            dial_call_status: Some(DialOutcome::from(outcome)),
            ..event("in-progress", to)
        }
    }

    fn session() -> SessionStart {
        SessionStart {
            twiml: AGENT_TWIML.to_string(),
            session_id: "call_123".to_string(),
        }
    }

    fn dispatcher(
        directory: RoutingDirectory,
        agent: MockVoiceAgent,
        fallback_enabled: bool,
    ) -> (CallEventDispatcher, Arc<MemoryCallStateStore>) {
        let store = Arc::new(MemoryCallStateStore::new());
        let dispatcher = CallEventDispatcher::new(
            directory,
            store.clone(),
            Arc::new(agent),
            fallback_enabled,
            Some("default-assistant-id".to_string()),
        );
        (dispatcher, store)
    }

    #[tokio::test]
    async fn test_ringing_without_routing_starts_default_agent() {
        let mut agent = MockVoiceAgent::new();
        agent
            .expect_start_session()
            .withf(|caller, called, assistant| {
                caller == "+15559876543"
                    && called == "+14805767537"
                    && assistant.as_deref() == Some("default-assistant-id")
            })
            .returning(|_, _, _| Ok(session()));

        let (dispatcher, store) = dispatcher(directory(false, Some(MAP)), agent, false);
        let twiml = dispatcher.dispatch(&event("ringing", "+14805767537"), &urls()).await;
        assert_eq!(twiml, AGENT_TWIML);
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_ringing_with_agent_only_policy_uses_policy_assistant() {
        let mut agent = MockVoiceAgent::new();
        agent
            .expect_start_session()
            .withf(|_, _, assistant| assistant.as_deref() == Some("main-business-assistant"))
            .returning(|_, _, _| Ok(session()));

        let (dispatcher, _) = dispatcher(directory(true, Some(MAP)), agent, false);
        let twiml = dispatcher.dispatch(&event("ringing", "+14805767537"), &urls()).await;
        assert_eq!(twiml, AGENT_TWIML);
    }

    #[tokio::test]
    async fn test_ringing_with_forward_policy_dials_and_records() {
        let mut agent = MockVoiceAgent::new();
        agent.expect_start_session().never();

        let (dispatcher, store) = dispatcher(directory(true, Some(MAP)), agent, true);
        let twiml = dispatcher.dispatch(&event("ringing", "+15551234567"), &urls()).await;

        assert!(twiml.contains("<Dial timeout=\"30\""));
        assert!(twiml.contains("<Number url=\"https://api.example.com/twilio/voice/whisper\">+15034688103</Number>"));
        assert!(twiml.contains("callerId=\"+15559876543\""));
        // no direct agent connect on a forwarded ringing event
        assert!(!twiml.contains("<Connect"));
        assert!(!twiml.contains("<Stream"));

        let record = store.get("CA0123456789abcdef0123456789abcdef").await.unwrap();
        assert_eq!(record.status, CallProgress::Forwarding);
        assert_eq!(record.original_caller, "+15559876543");
        assert_eq!(record.route.assistant_id.as_deref(), Some("owner-assistant"));
    }

    #[tokio::test]
    async fn test_agent_policy_never_emits_dial() {
        let mut agent = MockVoiceAgent::new();
        agent.expect_start_session().returning(|_, _, _| Ok(session()));

        let (dispatcher, _) = dispatcher(directory(true, Some(MAP)), agent, false);
        let twiml = dispatcher.dispatch(&event("ringing", "+14805767537"), &urls()).await;
        assert!(!twiml.contains("<Dial"));
    }

    #[tokio::test]
    async fn test_ringing_agent_failure_apologizes_and_hangs_up() {
        let mut agent = MockVoiceAgent::new();
        agent.expect_start_session().returning(|_, _, _| {
            Err(VapiError::Status {
                status: 500,
                body: "boom".to_string(),
            })
        });

        let (dispatcher, _) = dispatcher(directory(false, None), agent, false);
        let twiml = dispatcher.dispatch(&event("ringing", "+14805767537"), &urls()).await;
        assert!(twiml.contains("technical difficulties"));
        assert!(twiml.contains("<Hangup/>"));
    }

    #[tokio::test]
    async fn test_no_answer_transfers_to_stored_assistant() {
        let mut agent = MockVoiceAgent::new();
        agent.expect_start_session().never();

        let (dispatcher, store) = dispatcher(directory(true, Some(MAP)), agent, true);
        dispatcher.dispatch(&event("ringing", "+15551234567"), &urls()).await;

        // rebuild the dispatcher with an agent that expects the stored assistant
        let mut agent = MockVoiceAgent::new();
        agent
            .expect_start_session()
            .withf(|_, _, assistant| assistant.as_deref() == Some("owner-assistant"))
            .returning(|_, _, _| Ok(session()));
        let dispatcher = CallEventDispatcher::new(
            directory(true, Some(MAP)),
            store.clone(),
            Arc::new(agent),
            true,
            Some("default-assistant-id".to_string()),
        );

        let twiml = dispatcher.dispatch(&dial_event("no-answer", "+15551234567"), &urls()).await;
        assert_eq!(twiml, AGENT_TWIML);
        let record = store.get("CA0123456789abcdef0123456789abcdef").await.unwrap();
        assert_eq!(record.status, CallProgress::TransferredToVoiceAgent);
    }

    #[tokio::test]
    async fn test_no_answer_with_fallback_disabled_hangs_up() {
        let mut agent = MockVoiceAgent::new();
        agent.expect_start_session().never();

        let (dispatcher, store) = dispatcher(directory(true, Some(MAP)), agent, false);
        dispatcher.dispatch(&event("ringing", "+15551234567"), &urls()).await;
        let twiml = dispatcher.dispatch(&dial_event("busy", "+15551234567"), &urls()).await;

        assert!(twiml.contains("<Hangup/>"));
        assert!(!twiml.contains("<Say"));
        assert!(store.get("CA0123456789abcdef0123456789abcdef").await.is_some());
    }

    #[tokio::test]
    async fn test_no_answer_transfer_failure_apologizes() {
        let mut agent = MockVoiceAgent::new();
        agent.expect_start_session().never();
        let (dispatcher, store) = dispatcher(directory(true, Some(MAP)), agent, true);
        dispatcher.dispatch(&event("ringing", "+15551234567"), &urls()).await;

        let mut agent = MockVoiceAgent::new();
        agent
            .expect_start_session()
            .returning(|_, _, _| Err(VapiError::NotConfigured));
        let dispatcher = CallEventDispatcher::new(
            directory(true, Some(MAP)),
            store,
            Arc::new(agent),
            true,
            None,
        );

        let twiml = dispatcher.dispatch(&dial_event("failed", "+15551234567"), &urls()).await;
        assert!(twiml.contains("I apologize"));
        assert!(twiml.contains("<Hangup/>"));
    }

    #[tokio::test]
    async fn test_dial_answered_marks_record() {
        let mut agent = MockVoiceAgent::new();
        agent.expect_start_session().never();

        let (dispatcher, store) = dispatcher(directory(true, Some(MAP)), agent, true);
        dispatcher.dispatch(&event("ringing", "+15551234567"), &urls()).await;
        let twiml = dispatcher.dispatch(&dial_event("answered", "+15551234567"), &urls()).await;

        assert!(twiml.contains("<Response></Response>"));
        let record = store.get("CA0123456789abcdef0123456789abcdef").await.unwrap();
        assert_eq!(record.status, CallProgress::Answered);
    }

    #[tokio::test]
    async fn test_dial_status_without_record_is_noop() {
        let mut agent = MockVoiceAgent::new();
        agent.expect_start_session().never();

        let (dispatcher, _) = dispatcher(directory(true, Some(MAP)), agent, true);
        let twiml = dispatcher.dispatch(&dial_event("no-answer", "+15551234567"), &urls()).await;
        assert!(twiml.contains("<Response></Response>"));
    }

    #[tokio::test]
    async fn test_completed_twice_is_idempotent() {
        let mut agent = MockVoiceAgent::new();
        agent.expect_start_session().never();
        agent.expect_end_session().returning(|_| Ok(()));

        let (dispatcher, store) = dispatcher(directory(true, Some(MAP)), agent, true);
        dispatcher.dispatch(&event("ringing", "+15551234567"), &urls()).await;

        let first = dispatcher.dispatch(&event("completed", "+15551234567"), &urls()).await;
        assert!(first.contains("<Response></Response>"));
        assert!(store.get("CA0123456789abcdef0123456789abcdef").await.is_none());

        let second = dispatcher.dispatch(&event("completed", "+15551234567"), &urls()).await;
        assert!(second.contains("<Response></Response>"));
    }

    #[tokio::test]
    async fn test_malformed_map_behaves_like_routing_disabled() {
        let mut agent = MockVoiceAgent::new();
        agent
            .expect_start_session()
            .withf(|_, _, assistant| assistant.as_deref() == Some("default-assistant-id"))
            .returning(|_, _, _| Ok(session()));

        let (dispatcher, store) = dispatcher(directory(true, Some("{broken")), agent, true);
        let twiml = dispatcher.dispatch(&event("ringing", "+15551234567"), &urls()).await;
        assert_eq!(twiml, AGENT_TWIML);
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_status_yields_empty_response() {
        let mut agent = MockVoiceAgent::new();
        agent.expect_start_session().never();

        let (dispatcher, _) = dispatcher(directory(true, Some(MAP)), agent, true);
        let twiml = dispatcher.dispatch(&event("queued", "+15551234567"), &urls()).await;
        assert!(twiml.contains("<Response></Response>"));
    }

    #[tokio::test]
    async fn test_whisper_uses_explicit_message() {
        let map = r#"{"+15551234567": {"targetNumber": "+15034688103", "whisperMessage": "Office line"}}"#;
        let agent = MockVoiceAgent::new();
        let (dispatcher, _) = dispatcher(directory(true, Some(map)), agent, true);

        let twiml = dispatcher.whisper_response(&event("in-progress", "+15034688103"));
        assert!(twiml.contains("Office line"));
    }

    #[tokio::test]
    async fn test_whisper_falls_back_to_description() {
        let map = r#"{"+15551234567": {"targetNumber": "+15034688103", "description": "Owner line"}}"#;
        let agent = MockVoiceAgent::new();
        let (dispatcher, _) = dispatcher(directory(true, Some(map)), agent, true);

        let twiml = dispatcher.whisper_response(&event("in-progress", "+15034688103"));
        assert!(twiml.contains("Owner line: Call from +15559876543"));
    }

    #[tokio::test]
    async fn test_whisper_unmapped_target_names_both_numbers() {
        let agent = MockVoiceAgent::new();
        let (dispatcher, _) = dispatcher(directory(true, Some(MAP)), agent, true);

        let twiml = dispatcher.whisper_response(&event("in-progress", "+19998887777"));
        assert!(twiml.contains("+19998887777"));
        assert!(twiml.contains("+15559876543"));
        assert!(twiml.contains("<Say"));
    }
}
