//! Wire envelope for session ↔ client messages.
//!
//! Outbound (session → client) every message is
//! `{"event": <kind>, "data": {...}, "timestamp": <ISO-8601>}`.
//! Inbound control frames are tagged by `"type"`.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::ids::{ExecutionId, RunId, ThreadId};
use crate::payload::{self, Payload};

/// The five Golden Path lifecycle events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Execution accepted.
    AgentStarted,
    /// Agent is reasoning.
    AgentThinking,
    /// A tool call began.
    ToolExecuting,
    /// A tool call returned.
    ToolCompleted,
    /// Execution finished, successfully or not.
    AgentCompleted,
}

impl EventKind {
    /// All kinds in causal order.
    pub const ALL: [Self; 5] = [
        Self::AgentStarted,
        Self::AgentThinking,
        Self::ToolExecuting,
        Self::ToolCompleted,
        Self::AgentCompleted,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentStarted => "agent_started",
            Self::AgentThinking => "agent_thinking",
            Self::ToolExecuting => "tool_executing",
            Self::ToolCompleted => "tool_completed",
            Self::AgentCompleted => "agent_completed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ISO-8601 UTC timestamp with millisecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Outbound event envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    /// Lifecycle kind.
    pub event: EventKind,
    /// Event payload. Always a JSON object.
    pub data: Map<String, Value>,
    /// When the event was produced.
    pub timestamp: String,
}

impl WireEvent {
    /// Build an event stamped with the current time.
    ///
    /// The payload is sanitized so the envelope always survives a JSON
    /// round-trip.
    pub fn new(event: EventKind, data: Payload) -> Self {
        Self {
            event,
            data: payload::sanitize_map(data),
            timestamp: now_timestamp(),
        }
    }

    /// Build an event from any serializable payload, substituting a string
    /// representation for anything JSON cannot carry.
    pub fn from_serialize<T>(event: EventKind, data: &T) -> Self
    where
        T: Serialize + fmt::Debug + ?Sized,
    {
        Self::new(event, payload::to_payload(data))
    }

    /// Serialize to the wire format.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a wire message.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// `data.success` for `agent_completed` events.
    pub fn success(&self) -> Option<bool> {
        self.data.get("success").and_then(Value::as_bool)
    }

    /// `data.executionId`, when present.
    pub fn execution_id(&self) -> Option<&str> {
        self.data.get("executionId").and_then(Value::as_str)
    }
}

fn base(execution_id: &ExecutionId) -> Payload {
    let mut data = Map::new();
    let _ = data.insert("executionId".into(), Value::String(execution_id.to_string()));
    data
}

/// `agent_started`.
pub fn agent_started(
    execution_id: &ExecutionId,
    agent_name: &str,
    thread_id: &ThreadId,
    run_id: &RunId,
) -> WireEvent {
    let mut data = base(execution_id);
    let _ = data.insert("agentName".into(), json!(agent_name));
    let _ = data.insert("threadId".into(), json!(thread_id));
    let _ = data.insert("runId".into(), json!(run_id));
    WireEvent::new(EventKind::AgentStarted, data)
}

/// `agent_thinking`, optionally carrying a progress message.
pub fn agent_thinking(execution_id: &ExecutionId, thought: Option<&str>) -> WireEvent {
    let mut data = base(execution_id);
    if let Some(thought) = thought {
        let _ = data.insert("thought".into(), json!(thought));
    }
    WireEvent::new(EventKind::AgentThinking, data)
}

/// `tool_executing`.
pub fn tool_executing(execution_id: &ExecutionId, tool_name: &str, input: Value) -> WireEvent {
    let mut data = base(execution_id);
    let _ = data.insert("toolName".into(), json!(tool_name));
    let _ = data.insert("input".into(), input);
    WireEvent::new(EventKind::ToolExecuting, data)
}

/// `tool_completed`.
pub fn tool_completed(execution_id: &ExecutionId, tool_name: &str, output: Value) -> WireEvent {
    let mut data = base(execution_id);
    let _ = data.insert("toolName".into(), json!(tool_name));
    let _ = data.insert("output".into(), output);
    WireEvent::new(EventKind::ToolCompleted, data)
}

/// `agent_completed`. `extra` keys are merged into the payload.
pub fn agent_completed(execution_id: &ExecutionId, success: bool, extra: Payload) -> WireEvent {
    let mut data = base(execution_id);
    let _ = data.insert("success".into(), Value::Bool(success));
    for (key, value) in extra {
        let _ = data.entry(key).or_insert(value);
    }
    WireEvent::new(EventKind::AgentCompleted, data)
}

/// `agent_completed` with `success: false` and a machine-readable reason.
pub fn agent_failed(execution_id: &ExecutionId, reason: &str, agent_name: &str) -> WireEvent {
    let mut extra = Map::new();
    let _ = extra.insert("reason".into(), json!(reason));
    let _ = extra.insert("agentName".into(), json!(agent_name));
    agent_completed(execution_id, false, extra)
}

/// Inbound control message (client → session).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Carries a credential for the external auth service. Not parsed here.
    Authenticate {
        /// Opaque bearer token.
        token: String,
    },
    /// Application-level keepalive.
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn kind_wire_names_match_serde() {
        for kind in EventKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn envelope_shape() {
        let exec = ExecutionId::from("exec_1");
        let event = agent_thinking(&exec, Some("planning"));
        let parsed: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(parsed["event"], "agent_thinking");
        assert_eq!(parsed["data"]["executionId"], "exec_1");
        assert_eq!(parsed["data"]["thought"], "planning");
        assert!(parsed["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn timestamp_is_rfc3339() {
        let ts = now_timestamp();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }

    #[test]
    fn failed_completion_carries_reason() {
        let exec = ExecutionId::from("exec_2");
        let event = agent_failed(&exec, "death_detected", "researcher");
        assert_eq!(event.event, EventKind::AgentCompleted);
        assert_eq!(event.success(), Some(false));
        assert_eq!(event.data["reason"], "death_detected");
        assert_eq!(event.execution_id(), Some("exec_2"));
    }

    #[test]
    fn completion_extra_cannot_override_success() {
        let exec = ExecutionId::from("exec_3");
        let mut extra = Map::new();
        let _ = extra.insert("success".into(), Value::Bool(false));
        let event = agent_completed(&exec, true, extra);
        assert_eq!(event.success(), Some(true));
    }

    #[test]
    fn decode_roundtrip() {
        let exec = ExecutionId::from("exec_4");
        let event = tool_executing(&exec, "search", json!({"q": "rust"}));
        let back = WireEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn inbound_authenticate_parses() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"type":"authenticate","token":"abc"}"#).unwrap();
        assert_matches!(msg, InboundMessage::Authenticate { token } if token == "abc");
    }

    #[test]
    fn inbound_unknown_type_rejected() {
        let result = serde_json::from_str::<InboundMessage>(r#"{"type":"subscribe"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn inbound_ping_parses() {
        let msg: InboundMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, InboundMessage::Ping);
    }
}
