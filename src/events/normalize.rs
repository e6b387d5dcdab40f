//! Structural validation of inbound payloads.

use serde_json::{Map, Value};

use super::{AgentIdentity, Event, EventData};

/// Result of classifying one decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// A well-formed agent-to-agent event. Feeds the graph.
    Event(Event),
    /// Anything else. Shown in the log only.
    Opaque(Value),
}

impl Classified {
    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Classified::Event(_) => "webhook-event",
            Classified::Opaque(_) => "opaque",
        }
    }

    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Classified::Event(event) => Some(event),
            Classified::Opaque(_) => None,
        }
    }
}

/// Classify a decoded payload.
///
/// Total: any missing or mistyped required field routes the payload to
/// [`Classified::Opaque`] untouched.
pub fn classify(raw: Value) -> Classified {
    match parse_event(&raw) {
        Some(event) => Classified::Event(event),
        None => Classified::Opaque(raw),
    }
}

fn parse_event(raw: &Value) -> Option<Event> {
    let obj = raw.as_object()?;

    let event_type = obj
        .get("event_type")?
        .as_str()
        .filter(|s| !s.trim().is_empty())?;
    let source_agent = parse_identity(obj.get("source_agent")?)?;
    let target_agents = obj
        .get("target_agents")?
        .as_array()?
        .iter()
        .map(parse_identity)
        .collect::<Option<Vec<_>>>()?;
    let timestamp = obj.get("timestamp")?.as_str()?;

    Some(Event {
        event_type: event_type.to_string(),
        source_agent,
        target_agents,
        timestamp: timestamp.to_string(),
        data: obj.get("data").and_then(Value::as_object).map(parse_data),
    })
}

fn parse_identity(value: &Value) -> Option<AgentIdentity> {
    let obj = value.as_object()?;
    Some(AgentIdentity {
        id: obj.get("id")?.as_str()?.to_string(),
        username: obj.get("username")?.as_str()?.to_string(),
    })
}

/// Lift `message` and `mood` when they are strings; keep every other member
/// (and mistyped ones) in `extra`.
fn parse_data(obj: &Map<String, Value>) -> EventData {
    let mut data = EventData::default();
    for (key, value) in obj {
        match (key.as_str(), value) {
            ("message", Value::String(s)) => data.message = Some(s.clone()),
            ("mood", Value::String(s)) => data.mood = Some(s.clone()),
            _ => {
                data.extra.insert(key.clone(), value.clone());
            }
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid() -> Value {
        json!({
            "event_type": "chat",
            "source_agent": {"id": "1", "username": "Ada"},
            "target_agents": [{"id": "2", "username": "Grace"}],
            "timestamp": "2024-01-01T00:00:00Z",
            "data": {"message": "hi", "mood": "happy", "tick": 3}
        })
    }

    #[test]
    fn test_valid_event() {
        let classified = classify(valid());
        assert_eq!(classified.kind(), "webhook-event");

        let event = classified.as_event().unwrap();
        assert_eq!(event.event_type, "chat");
        assert_eq!(event.source_agent, AgentIdentity::new("1", "Ada"));
        assert_eq!(event.target_agents, vec![AgentIdentity::new("2", "Grace")]);
        assert_eq!(event.message(), Some("hi"));
        assert_eq!(event.mood(), Some("happy"));
        assert_eq!(event.data.as_ref().unwrap().extra.get("tick"), Some(&json!(3)));
    }

    #[test]
    fn test_empty_targets_is_valid() {
        let mut raw = valid();
        raw["target_agents"] = json!([]);
        assert!(classify(raw).as_event().is_some());
    }

    #[test]
    fn test_missing_data_is_valid() {
        let mut raw = valid();
        raw.as_object_mut().unwrap().remove("data");
        let classified = classify(raw);
        assert_eq!(classified.as_event().unwrap().data, None);
    }

    #[test]
    fn test_non_object_data_is_dropped() {
        let mut raw = valid();
        raw["data"] = json!("not an object");
        let classified = classify(raw);
        assert_eq!(classified.as_event().unwrap().data, None);
    }

    #[test]
    fn test_mistyped_message_kept_in_extra() {
        let mut raw = valid();
        raw["data"] = json!({"message": 5});
        let event = match classify(raw) {
            Classified::Event(event) => event,
            other => panic!("expected event, got {:?}", other),
        };
        assert_eq!(event.message(), None);
        assert_eq!(event.data.unwrap().extra.get("message"), Some(&json!(5)));
    }

    #[test]
    fn test_invalid_payloads_are_opaque() {
        let cases: Vec<Box<dyn Fn(&mut Value)>> = vec![
            Box::new(|v: &mut Value| v["event_type"] = json!("")),
            Box::new(|v: &mut Value| v["event_type"] = json!("   ")),
            Box::new(|v: &mut Value| v["event_type"] = json!(7)),
            Box::new(|v: &mut Value| {
                v.as_object_mut().unwrap().remove("event_type");
            }),
            Box::new(|v: &mut Value| v["source_agent"] = json!({"id": "1"})),
            Box::new(|v: &mut Value| v["source_agent"] = json!({"id": 1, "username": "Ada"})),
            Box::new(|v: &mut Value| v["source_agent"] = json!("Ada")),
            Box::new(|v: &mut Value| v["target_agents"] = json!({"id": "2", "username": "Grace"})),
            Box::new(|v: &mut Value| v["target_agents"] = json!([{"id": "2"}])),
            Box::new(|v: &mut Value| v["target_agents"] = json!([{"id": "2", "username": "G"}, null])),
            Box::new(|v: &mut Value| v["timestamp"] = json!(1_704_067_200)),
            Box::new(|v: &mut Value| {
                v.as_object_mut().unwrap().remove("timestamp");
            }),
        ];

        for (i, mutate) in cases.iter().enumerate() {
            let mut raw = valid();
            mutate(&mut raw);
            let classified = classify(raw.clone());
            assert_eq!(classified, Classified::Opaque(raw), "case {}", i);
        }
    }

    #[test]
    fn test_scalars_are_opaque() {
        for raw in [json!("plain text"), json!(null), json!(1), json!([1, 2])] {
            assert_eq!(classify(raw.clone()).kind(), "opaque", "{}", raw);
        }
    }
}
