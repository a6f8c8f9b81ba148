//! Socket message definitions.
//!
//! Every frame is a JSON object with a numeric `type` and a `body`:
//!
//! ```json
//! { "type": 1, "body": "say hello" }                      // command
//! { "type": 2, "body": ["Player Spawned", "Weather"] }    // subscribe
//! { "type": 3, "body": ["Weather"] }                      // unsubscribe
//! ```
//!
//! Outbound events reuse type `2` with an object body:
//!
//! ```json
//! { "type": 2, "body": { "event": "Weather", "type": 6, "data": { ... } } }
//! ```

use crate::error::{BridgeError, Result};
use crate::events::DomainEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const TYPE_COMMAND: u8 = 1;
const TYPE_SUBSCRIBE: u8 = 2;
const TYPE_UNSUBSCRIBE: u8 = 3;
const TYPE_EVENT: u8 = 2;

/// A message received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Console command to run on the server.
    Command(String),
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<u8>,
    #[serde(default)]
    body: Value,
}

impl InboundMessage {
    /// Parses a text frame. Invalid JSON, unknown types and ill-shaped bodies
    /// are all errors; the caller logs and drops them.
    pub fn parse(text: &str) -> Result<Self> {
        let frame: RawFrame = serde_json::from_str(text)?;

        match frame.kind {
            Some(TYPE_COMMAND) => match frame.body {
                Value::String(command) => Ok(InboundMessage::Command(command)),
                other => Err(BridgeError::Protocol(format!(
                    "command body must be a string, got {other}"
                ))),
            },
            Some(TYPE_SUBSCRIBE) => Ok(InboundMessage::Subscribe(event_names(frame.body)?)),
            Some(TYPE_UNSUBSCRIBE) => Ok(InboundMessage::Unsubscribe(event_names(frame.body)?)),
            _ => Err(BridgeError::Protocol("Invalid or missing type".to_string())),
        }
    }
}

fn event_names(body: Value) -> Result<Vec<String>> {
    serde_json::from_value(body)
        .map_err(|e| BridgeError::Protocol(format!("expected a list of event names: {e}")))
}

/// A message sent to peers.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Event(DomainEvent),
}

#[derive(Serialize)]
struct EventFrame<'a> {
    #[serde(rename = "type")]
    kind: u8,
    body: EventBody<'a>,
}

#[derive(Serialize)]
struct EventBody<'a> {
    event: &'a str,
    #[serde(rename = "type")]
    code: u8,
    data: &'a Value,
}

impl OutboundMessage {
    pub fn encode(&self) -> Result<String> {
        match self {
            OutboundMessage::Event(event) => {
                let frame = EventFrame {
                    kind: TYPE_EVENT,
                    body: EventBody {
                        event: event.kind.name(),
                        code: event.kind.code(),
                        data: &event.data,
                    },
                };
                Ok(serde_json::to_string(&frame)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use serde_json::json;

    #[test]
    fn test_parse_command() {
        let msg = InboundMessage::parse(r#"{"type":1,"body":"time set day"}"#).unwrap();
        assert_eq!(msg, InboundMessage::Command("time set day".to_string()));
    }

    #[test]
    fn test_parse_subscriptions() {
        let msg = InboundMessage::parse(r#"{"type":2,"body":["Weather","Death"]}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::Subscribe(vec!["Weather".to_string(), "Death".to_string()])
        );

        let msg = InboundMessage::parse(r#"{"type":3,"body":["Weather"]}"#).unwrap();
        assert_eq!(msg, InboundMessage::Unsubscribe(vec!["Weather".to_string()]));
    }

    #[test]
    fn test_parse_rejects_bad_frames() {
        assert!(matches!(
            InboundMessage::parse("not json"),
            Err(BridgeError::Json(_))
        ));
        assert!(matches!(
            InboundMessage::parse(r#"{"body":"x"}"#),
            Err(BridgeError::Protocol(_))
        ));
        assert!(matches!(
            InboundMessage::parse(r#"{"type":9,"body":"x"}"#),
            Err(BridgeError::Protocol(_))
        ));
        assert!(matches!(
            InboundMessage::parse(r#"{"type":2,"body":"Weather"}"#),
            Err(BridgeError::Protocol(_))
        ));
        assert!(matches!(
            InboundMessage::parse(r#"{"type":1,"body":["say"]}"#),
            Err(BridgeError::Protocol(_))
        ));
    }

    #[test]
    fn test_encode_event() {
        let event = DomainEvent::new(EventKind::Weather, json!({"previous": 0, "new": 1}));
        let text = OutboundMessage::Event(event).encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(
            value,
            json!({
                "type": 2,
                "body": {
                    "event": "Weather",
                    "type": 6,
                    "data": {"previous": 0, "new": 1}
                }
            })
        );
    }
}
