//! Scripting channel encoding.
//!
//! Outbound, the bridge writes `scriptevent link:<name> <json>` to the server
//! console; the script receives it through its script-event hook. Inbound,
//! the script logs `@<name>><json>` (or a bare `@<name>`) which shows up in
//! the server output behind a `[Scripting] ` prefix.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event name carrying a correlated request.
pub const CALLBACK_EVENT: &str = "callback";
/// Event name carrying the reply to a correlated request.
pub const CALLBACK_RETURN_EVENT: &str = "callbackReturn";

const SCRIPT_EVENT_NAMESPACE: &str = "link";

/// A named event written to the server console.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptCommand {
    pub event: String,
    pub payload: Value,
}

impl ScriptCommand {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// Renders the console line, without the trailing newline.
    pub fn encode(&self) -> Result<String> {
        Ok(format!(
            "scriptevent {SCRIPT_EVENT_NAMESPACE}:{} {}",
            self.event,
            serde_json::to_string(&self.payload)?
        ))
    }
}

/// Splits the text following `@` into an event name and optional payload.
///
/// The name runs up to the first `>`. Nothing after the `>` (or no `>` at
/// all) means a signal without payload; otherwise the remainder must be JSON.
pub fn parse_event_line(text: &str) -> Result<(String, Option<Value>)> {
    let (name, rest) = match text.find('>') {
        Some(idx) => (&text[..idx], text[idx + 1..].trim()),
        None => (text.trim(), ""),
    };

    if name.is_empty() {
        return Err(BridgeError::Protocol(format!("script event without a name: @{text}")));
    }
    if rest.is_empty() {
        return Ok((name.to_string(), None));
    }

    let payload = serde_json::from_str(rest)?;
    Ok((name.to_string(), Some(payload)))
}

/// Payload of a `callback` event: asks the other side to run `event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackRequest {
    #[serde(rename = "cbID")]
    pub id: String,
    pub event: String,
    #[serde(default)]
    pub message: Value,
}

/// Payload of a `callbackReturn` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackReturn {
    #[serde(rename = "cbID")]
    pub id: String,
    #[serde(default)]
    pub message: Value,
}
