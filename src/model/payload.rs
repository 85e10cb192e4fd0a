use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::util::now_millis;

/// The game actions two participants exchange.
///
/// Serialized as the bare tag (`"END_TURN"`, `"MOVE_TROOPS"`, `"CHAT_MESSAGE"`)
/// so the wire stays readable by the browser client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    EndTurn,
    MoveTroops,
    ChatMessage,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::EndTurn => "END_TURN",
            ActionKind::MoveTroops => "MOVE_TROOPS",
            ActionKind::ChatMessage => "CHAT_MESSAGE",
        }
    }
}

/// One game action as it travels over the data channel or the relay.
///
/// The payload is opaque to the transport layers; only the game adapter
/// interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEnvelope {
    pub action: ActionKind,
    #[serde(default)]
    pub payload: Value,
    /// Milliseconds since the epoch on the producer's clock.
    #[serde(default)]
    pub timestamp: i64,
}

impl ActionEnvelope {
    pub fn new(action: ActionKind, payload: Value) -> ActionEnvelope {
        Self {
            action,
            payload,
            timestamp: now_millis(),
        }
    }

    pub fn timestamp(&self) -> String {
        match Utc.timestamp_millis_opt(self.timestamp).single() {
            Some(t) => t.to_rfc3339(),
            None => self.timestamp.to_string(),
        }
    }

    pub fn latency(&self) -> String {
        format!("{}ms", now_millis().saturating_sub(self.timestamp))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::MalformedMessage(e.to_string()))
    }

    /// Decode one transport message. Anything that is not a complete envelope
    /// is rejected rather than partially applied.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::MalformedMessage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn envelope_uses_browser_field_names() {
        let envelope = ActionEnvelope {
            action: ActionKind::ChatMessage,
            payload: json!({ "text": "hi" }),
            timestamp: 1_700_000_000_000,
        };

        let value: Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "action": "CHAT_MESSAGE",
                "payload": { "text": "hi" },
                "timestamp": 1_700_000_000_000_i64,
            })
        );
    }

    #[test]
    fn decodes_envelope_without_timestamp() {
        // The relay fallback in older clients omits the timestamp.
        let envelope =
            ActionEnvelope::decode(br#"{"action":"END_TURN","payload":{"player":2,"turn":2}}"#)
                .unwrap();
        assert_eq!(envelope.action, ActionKind::EndTurn);
        assert_eq!(envelope.timestamp, 0);
    }

    #[test]
    fn rejects_unknown_action_and_garbage() {
        assert!(matches!(
            ActionEnvelope::decode(br#"{"action":"NUKE","payload":{}}"#),
            Err(Error::MalformedMessage(_))
        ));
        assert!(matches!(
            ActionEnvelope::decode(b"hello from peer"),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn timestamp_renders_as_rfc3339() {
        let envelope = ActionEnvelope {
            action: ActionKind::EndTurn,
            payload: Value::Null,
            timestamp: 0,
        };
        assert_eq!(envelope.timestamp(), "1970-01-01T00:00:00+00:00");
    }

    #[test]
    fn extreme_remote_timestamps_do_not_panic() {
        let oldest = ActionEnvelope::decode(
            br#"{"action":"CHAT_MESSAGE","payload":{"text":"x"},"timestamp":-9223372036854775808}"#,
        )
        .unwrap();
        assert_eq!(oldest.latency(), format!("{}ms", i64::MAX));
        assert_eq!(oldest.timestamp(), i64::MIN.to_string());

        let future = ActionEnvelope {
            timestamp: i64::MAX,
            ..oldest
        };
        assert!(future.latency().starts_with('-'));
        assert_eq!(future.timestamp(), i64::MAX.to_string());
    }
}
