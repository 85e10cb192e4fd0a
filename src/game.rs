//! Game state adapter: the seam between the session core and the game rules.
//!
//! The core only dispatches envelopes by `action`; the typed payloads below
//! are what the game side reads and writes. `TurnState` is the reference
//! adapter the CLI uses.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::payload::{ActionEnvelope, ActionKind};

/// Called by the core whenever a remote action arrives on either path.
///
/// Implementations must tolerate the same envelope twice and actions that
/// arrive out of turn order.
pub trait GameStateAdapter {
    fn apply_remote_action(&mut self, envelope: &ActionEnvelope);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndTurn {
    /// The player whose turn starts.
    pub player: u8,
    pub turn: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveTroops {
    pub from: String,
    pub to: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
}

/// Typed form of the three actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameAction {
    EndTurn(EndTurn),
    MoveTroops(MoveTroops),
    ChatMessage(ChatMessage),
}

impl GameAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            GameAction::EndTurn(_) => ActionKind::EndTurn,
            GameAction::MoveTroops(_) => ActionKind::MoveTroops,
            GameAction::ChatMessage(_) => ActionKind::ChatMessage,
        }
    }

    pub fn payload(&self) -> Value {
        let payload = match self {
            GameAction::EndTurn(p) => serde_json::to_value(p),
            GameAction::MoveTroops(p) => serde_json::to_value(p),
            GameAction::ChatMessage(p) => serde_json::to_value(p),
        };
        // Plain structs of strings and integers always serialize.
        payload.unwrap_or(Value::Null)
    }

    pub fn chat(text: impl Into<String>) -> Self {
        GameAction::ChatMessage(ChatMessage { text: text.into() })
    }

    /// Interpret an envelope's payload according to its `action`.
    pub fn from_envelope(envelope: &ActionEnvelope) -> Result<Self> {
        let payload = envelope.payload.clone();
        let parsed = match envelope.action {
            ActionKind::EndTurn => serde_json::from_value(payload).map(GameAction::EndTurn),
            ActionKind::MoveTroops => serde_json::from_value(payload).map(GameAction::MoveTroops),
            ActionKind::ChatMessage => {
                serde_json::from_value(payload).map(GameAction::ChatMessage)
            }
        };
        parsed.map_err(|e| {
            Error::MalformedMessage(format!("{} payload: {e}", envelope.action.as_str()))
        })
    }
}

/// Two-player turn bookkeeping plus the message log the UI shows.
#[derive(Debug, Clone)]
pub struct TurnState {
    pub current_player: u8,
    pub turn: u32,
    pub messages: Vec<String>,
    seen: HashSet<String>,
}

impl Default for TurnState {
    fn default() -> Self {
        Self {
            current_player: 1,
            turn: 1,
            messages: Vec::new(),
            seen: HashSet::new(),
        }
    }
}

impl TurnState {
    pub fn new() -> TurnState {
        TurnState::default()
    }

    /// End the local turn. The returned action announces the player whose
    /// turn starts, for broadcasting.
    pub fn end_turn(&mut self) -> GameAction {
        self.current_player = if self.current_player == 1 { 2 } else { 1 };
        self.turn += 1;
        self.messages.push(format!("Turn {} begins", self.turn));
        GameAction::EndTurn(EndTurn {
            player: self.current_player,
            turn: self.turn,
        })
    }

    fn apply_end_turn(&mut self, end: EndTurn) {
        if end.turn <= self.turn {
            debug!("Ignoring stale END_TURN for turn {} (at {})", end.turn, self.turn);
            return;
        }

        self.turn = end.turn;
        self.current_player = end.player;
        self.messages.push(format!("Turn {} begins", self.turn));
        info!("Remote ended turn; player {} on turn {}", end.player, end.turn);
    }
}

impl GameStateAdapter for TurnState {
    fn apply_remote_action(&mut self, envelope: &ActionEnvelope) {
        // Same action, payload and timestamp means the same message.
        let key = format!(
            "{}|{}|{}",
            envelope.action.as_str(),
            envelope.timestamp,
            envelope.payload
        );
        if !self.seen.insert(key) {
            debug!("Duplicate {} ignored", envelope.action.as_str());
            return;
        }

        match GameAction::from_envelope(envelope) {
            Ok(GameAction::EndTurn(end)) => self.apply_end_turn(end),
            Ok(GameAction::MoveTroops(m)) => self
                .messages
                .push(format!("Opponent: moved {} troops from {} to {}", m.count, m.from, m.to)),
            Ok(GameAction::ChatMessage(c)) => self.messages.push(format!("Opponent: {}", c.text)),
            Err(e) => warn!("Dropping remote action: {}", e),
        }
    }
}
