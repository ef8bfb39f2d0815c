//! Gateway wire types.

use crate::events::RelayEvent;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Frame sent to event subscribers when the gateway stops.
pub const SHUTDOWN_EVENT_JSON: &str = r#"{"type":"event","event":"shutdown","payload":{}}"#;

/// Body of `PUT /rule`. A missing target keeps the current one, so a rule can be disabled without retyping it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleParams {
    #[serde(default)]
    pub target: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub template: Option<String>,
}

/// Wrap a relay event as `{ "type": "event", "event": "relay", "payload": ... }`.
pub fn event_frame(event: &RelayEvent) -> String {
    serde_json::to_string(&serde_json::json!({
        "type": "event",
        "event": "relay",
        "payload": event,
    }))
    .unwrap_or_else(|_| r#"{"type":"event","event":"relay","payload":{}}"#.to_string())
}
