//! Relay protocol vocabulary.
//!
//! Requests go from a participant to the relay as small JSON bodies; the
//! relay answers long-polls with a JSON array of `RelayEvent`s. The relay
//! never looks inside descriptors or action payloads, it only routes them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::descriptor::NetworkDescriptor;
use crate::model::payload::{ActionEnvelope, ActionKind};
use crate::model::session::{ParticipantId, SessionId};

/// Events delivered from the relay to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    /// Number of participants now in the session.
    MembershipUpdate { count: usize },
    /// The receiver should create the offer; `target` is the other side.
    NegotiateNow { target: ParticipantId },
    /// A negotiation descriptor forwarded from `from`.
    Signal {
        from: ParticipantId,
        signal: NetworkDescriptor,
    },
    /// A game action that took the fallback path.
    GameAction {
        session_id: SessionId,
        action: ActionKind,
        #[serde(default)]
        payload: Value,
        #[serde(default)]
        timestamp: i64,
    },
    /// The other participant disconnected or left.
    PeerLeft,
}

impl RelayEvent {
    pub fn game_action(session_id: SessionId, envelope: ActionEnvelope) -> Self {
        RelayEvent::GameAction {
            session_id,
            action: envelope.action,
            payload: envelope.payload,
            timestamp: envelope.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectReply {
    pub participant_id: ParticipantId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinReply {
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRequest {
    pub target: ParticipantId,
    pub signal: NetworkDescriptor,
}

/// Fallback action body. Same fields as `ActionEnvelope` plus the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub session_id: SessionId,
    pub action: ActionKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: i64,
}

impl ActionRequest {
    pub fn new(session_id: SessionId, envelope: &ActionEnvelope) -> Self {
        Self {
            session_id,
            action: envelope.action,
            payload: envelope.payload.clone(),
            timestamp: envelope.timestamp,
        }
    }

    pub fn into_envelope(self) -> ActionEnvelope {
        ActionEnvelope {
            action: self.action,
            payload: self.payload,
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReply {
    pub delivered: usize,
}
