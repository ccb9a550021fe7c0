use crate::config::{RoutingConfig, VapiConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

const DEFAULT_MAX_RING_TIME_MS: u64 = 30_000;

/// One raw entry of the routing map, keyed by the called number. Field names
/// follow the JSON the map is deployed with.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePolicy {
    pub target_number: Option<String>,
    #[serde(default = "default_true")]
    pub requires_answer: bool,
    pub vapi_assistant_id: Option<String>,
    /// Milliseconds.
    pub max_ring_time: Option<u64>,
    pub description: Option<String>,
    pub whisper_message: Option<String>,
}

fn default_true() -> bool {
    true
}

/// A policy resolved for one call, with defaults filled in.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedRoute {
    /// The number the caller dialed (on whisper legs: the number that
    /// forwards to the dialed target).
    pub called_number: String,
    pub target_number: Option<String>,
    pub requires_answer: bool,
    pub assistant_id: Option<String>,
    pub max_ring_time_ms: u64,
    pub description: Option<String>,
    pub whisper_message: Option<String>,
}

/// Static number→policy directory. Built once from configuration; a
/// malformed map is logged and treated as empty so a broken directory can
/// never fail a webhook.
#[derive(Debug, Clone, Default)]
pub struct RoutingDirectory {
    enabled: bool,
    entries: HashMap<String, RoutePolicy>,
    default_assistant_id: Option<String>,
    default_max_ring_time_ms: u64,
}

impl RoutingDirectory {
    pub fn from_config(routing: &RoutingConfig, vapi: &VapiConfig) -> Self {
        let entries = match routing.map.as_deref() {
            Some(raw) if routing.enabled => match serde_json::from_str(raw) {
                Ok(map) => map,
                Err(e) => {
                    warn!("malformed routing map, routing disabled: {}", e);
                    HashMap::new()
                }
            },
            _ => HashMap::new(),
        };
        Self {
            enabled: routing.enabled,
            entries,
            default_assistant_id: vapi.assistant_id.clone(),
            default_max_ring_time_ms: routing
                .default_forward_timeout
                .map(|secs| secs * 1000)
                .unwrap_or(DEFAULT_MAX_RING_TIME_MS),
        }
    }

    /// Look up the policy for a called number, filling defaults for missing
    /// fields. None means "no routing": disabled, empty/broken map, or no
    /// entry for this number.
    pub fn resolve_by_called_number(&self, number: &str) -> Option<ResolvedRoute> {
        if !self.enabled {
            debug!("phone routing disabled");
            return None;
        }
        let policy = self.entries.get(number)?;
        Some(self.resolve(number, policy, true))
    }

    /// Reverse lookup: find the entry whose target is `number`. Used on
    /// whisper legs, where the called number is the forwarding destination
    /// rather than the business number. Defaults are not synthesized here;
    /// the whisper composer falls back tier by tier.
    pub fn resolve_by_target_number(&self, number: &str) -> Option<ResolvedRoute> {
        if !self.enabled {
            return None;
        }
        self.entries
            .iter()
            .find(|(_, policy)| policy.target_number.as_deref() == Some(number))
            .map(|(called, policy)| self.resolve(called, policy, false))
    }

    fn resolve(&self, called: &str, policy: &RoutePolicy, fill_description: bool) -> ResolvedRoute {
        let description = policy.description.clone().or_else(|| {
            if fill_description {
                policy
                    .target_number
                    .as_ref()
                    .map(|target| format!("Forward {} → {}", called, target))
            } else {
                None
            }
        });
        ResolvedRoute {
            called_number: called.to_string(),
            target_number: policy.target_number.clone(),
            requires_answer: policy.requires_answer,
            assistant_id: policy
                .vapi_assistant_id
                .clone()
                .or_else(|| self.default_assistant_id.clone()),
            max_ring_time_ms: policy.max_ring_time.unwrap_or(self.default_max_ring_time_ms),
            description,
            whisper_message: policy.whisper_message.clone(),
        }
    }
}
