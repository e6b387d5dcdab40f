//! Wire types for the audit stream.
//!
//! Inbound frames are UTF-8 text. Each one is either a JSON object matching
//! [`Event`] or something else (plain text, other JSON) that is shown in the
//! log but never touches the graph. [`classify`] makes that call.
//!
//! Outbound frames are [`OutboundMessage`] JSON objects.

mod normalize;

pub use normalize::{Classified, classify};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An agent as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub id: String,
    pub username: String,
}

impl AgentIdentity {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}

/// One interaction from a source agent to zero or more targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub source_agent: AgentIdentity,
    pub target_agents: Vec<AgentIdentity>,
    /// ISO-8601 as sent by the producer. Parsed lazily.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<EventData>,
}

/// Free-form event payload. `message` and `mood` are lifted out; everything
/// else is kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    /// Message text, if the event carries a non-empty one.
    pub fn message(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.message.as_deref())
            .filter(|m| !m.trim().is_empty())
    }

    /// Mood reported for the source agent.
    pub fn mood(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.mood.as_deref())
            .filter(|m| !m.trim().is_empty())
    }

    /// The event timestamp, if it parses as RFC 3339.
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(self.timestamp.trim())
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// One-line summary for the log console.
    pub fn summary(&self) -> String {
        let targets = if self.target_agents.is_empty() {
            "-".to_string()
        } else {
            self.target_agents
                .iter()
                .map(|t| display_name(&t.username, &t.id))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let source = display_name(&self.source_agent.username, &self.source_agent.id);

        match self.message() {
            Some(message) => format!("[{}] {} -> {}: {}", self.event_type, source, targets, message),
            None => format!("[{}] {} -> {}", self.event_type, source, targets),
        }
    }
}

fn display_name<'a>(username: &'a str, id: &'a str) -> &'a str {
    if username.trim().is_empty() { id } else { username }
}

/// A raw text frame as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame(pub String);

impl InboundFrame {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Parse the frame as JSON, falling back to the raw text as a string value.
    pub fn decode(&self) -> Value {
        serde_json::from_str(&self.0).unwrap_or_else(|_| Value::String(self.0.clone()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Recipient of an outbound chat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Target {
    /// Broadcast to every agent.
    Global,
    /// A single agent by id.
    Agent(String),
}

impl From<String> for Target {
    fn from(value: String) -> Self {
        if value.trim().is_empty() || value.eq_ignore_ascii_case("global") {
            Target::Global
        } else {
            Target::Agent(value)
        }
    }
}

impl From<Target> for String {
    fn from(value: Target) -> Self {
        match value {
            Target::Global => "global".to_string(),
            Target::Agent(id) => id,
        }
    }
}

impl std::str::FromStr for Target {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Target::from(s.to_string()))
    }
}

/// Frame sent from the client to the audit server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub text: String,
    pub target: Target,
    pub timestamp: String,
}

impl OutboundMessage {
    /// Build a message stamped with the current time.
    pub fn new(text: impl Into<String>, target: Target) -> Self {
        Self {
            text: text.into(),
            target,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_json_frame() {
        let frame = InboundFrame::new(r#"{"a": 1}"#);
        assert_eq!(frame.decode(), json!({"a": 1}));
    }

    #[test]
    fn test_decode_malformed_frame_is_string() {
        let frame = InboundFrame::new("plain text");
        assert_eq!(frame.decode(), Value::String("plain text".to_string()));

        let frame = InboundFrame::new(r#"{"a": "#);
        assert_eq!(frame.decode(), Value::String(r#"{"a": "#.to_string()));
    }

    #[test]
    fn test_outbound_wire_shape() {
        let msg = OutboundMessage {
            text: "hello".to_string(),
            target: Target::Global,
            timestamp: "2024-01-01T00:00:00.000Z".to_string(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"text": "hello", "target": "global", "timestamp": "2024-01-01T00:00:00.000Z"})
        );

        let direct = OutboundMessage::new("psst", Target::Agent("agent-7".to_string()));
        let value = serde_json::to_value(&direct).unwrap();
        assert_eq!(value["target"], "agent-7");
        assert!(chrono::DateTime::parse_from_rfc3339(value["timestamp"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_target_parsing() {
        assert_eq!("global".parse::<Target>().unwrap(), Target::Global);
        assert_eq!("GLOBAL".parse::<Target>().unwrap(), Target::Global);
        assert_eq!("42".parse::<Target>().unwrap(), Target::Agent("42".to_string()));
    }

    #[test]
    fn test_event_helpers() {
        let event = Event {
            event_type: "chat".to_string(),
            source_agent: AgentIdentity::new("1", "Ada"),
            target_agents: vec![AgentIdentity::new("2", "")],
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            data: Some(EventData {
                message: Some("hi".to_string()),
                mood: Some("  ".to_string()),
                extra: Map::new(),
            }),
        };

        assert_eq!(event.message(), Some("hi"));
        assert_eq!(event.mood(), None);
        assert_eq!(
            event.parsed_timestamp().map(|t| t.timestamp()),
            Some(1_704_067_200)
        );
        assert_eq!(event.summary(), "[chat] Ada -> 2: hi");
    }
}
