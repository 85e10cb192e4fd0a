//! Two-player session negotiation and turn-based action sync.
//!
//! A relay (`server`) groups participants into sessions of two and forwards
//! negotiation descriptors between them. Each participant (`peer::Peer`)
//! negotiates a direct WebRTC data channel and falls back to the relay for
//! game actions whenever the channel is not usable.

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod game;
pub mod model;
pub mod negotiator;
pub mod peer;
pub mod server;
pub mod util;

pub use channel::{ActionChannel, Route};
pub use client::{RelayClient, RelayNotice, RelayPort};
pub use config::{ClientConfig, LinkConfig, RelayConfig};
pub use error::{Error, Result};
pub use game::{GameAction, GameStateAdapter, TurnState};
pub use model::payload::{ActionEnvelope, ActionKind};
pub use model::session::{ParticipantId, SessionId};
pub use negotiator::{NegotiationState, Negotiator};
pub use peer::{Peer, PeerEvent, StatusUpdate};
pub use server::{start_relay, RelayHandle};
