//! Session controller.
//!
//! `Peer` owns the whole object graph of one participant: the relay client,
//! the negotiator with its PeerLink, the action channel and the game adapter.
//! Everything it does is a reaction to one `PeerEvent`, dispatched by kind in
//! `handle`. Callers drive it by calling `tick()` from their loop, the same
//! way the str0m examples pump `poll_output()`.
//!
//! The UI observes through `subscribe()`; it never touches protocol state.

use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::channel::{ActionChannel, Route};
use crate::client::{RelayNotice, RelayPort};
use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::game::{GameAction, GameStateAdapter};
use crate::model::payload::{ActionEnvelope, ActionKind};
use crate::model::session::{Role, Session, SessionId};
use crate::model::wire::RelayEvent;
use crate::negotiator::{LinkRole, NegotiationState, Negotiator, Outgoing, Transition};

/// User-visible status lines.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    SessionStarted { id: SessionId, role: Role },
    Membership { count: usize },
    Negotiating { role: LinkRole },
    Established { flushed: usize },
    LinkClosed,
    PeerLeft,
    RelayLost { reason: String },
    SendFailed { reason: String },
    Failed { reason: String },
    Left,
}

impl fmt::Display for StatusUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusUpdate::SessionStarted { id, role: Role::Host } => {
                write!(f, "Room created: {id}. Share the link with your opponent")
            }
            StatusUpdate::SessionStarted { id, role: Role::Guest } => {
                write!(f, "Joining room {id}...")
            }
            StatusUpdate::Membership { count } => write!(f, "Connected, {count}/2 in room"),
            StatusUpdate::Negotiating { role: LinkRole::Initiator } => {
                write!(f, "Opponent ready, creating P2P connection...")
            }
            StatusUpdate::Negotiating { role: LinkRole::Responder } => {
                write!(f, "Answering P2P connection...")
            }
            StatusUpdate::Established { .. } => {
                write!(f, "P2P data channel established, game on")
            }
            StatusUpdate::LinkClosed => write!(f, "P2P connection closed, using relay"),
            StatusUpdate::PeerLeft => write!(f, "Opponent left the room"),
            StatusUpdate::RelayLost { reason } => write!(f, "Relay connection lost: {reason}"),
            StatusUpdate::SendFailed { reason } => write!(f, "Could not send: {reason}"),
            StatusUpdate::Failed { reason } => write!(f, "Error: {reason}"),
            StatusUpdate::Left => write!(f, "Left the room"),
        }
    }
}

/// Everything the controller reacts to.
#[derive(Debug)]
pub enum PeerEvent {
    Relay(RelayNotice),
    Link(Transition),
    Data(Vec<u8>),
}

pub struct Peer<R: RelayPort, G: GameStateAdapter> {
    relay: R,
    game: G,
    negotiator: Negotiator,
    channel: ActionChannel,
    session: Option<Session>,
    observers: Vec<Sender<StatusUpdate>>,
}

impl<R: RelayPort, G: GameStateAdapter> Peer<R, G> {
    pub fn new(relay: R, game: G, link: LinkConfig) -> Self {
        Self {
            relay,
            game,
            negotiator: Negotiator::new(link),
            channel: ActionChannel::new(),
            session: None,
            observers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self) -> Receiver<StatusUpdate> {
        let (tx, rx) = mpsc::channel();
        self.observers.push(tx);
        rx
    }

    /// Create a fresh session (`<base>_<millis>`) and join it as host.
    pub fn host(&mut self, base: Option<&str>) -> Result<SessionId> {
        self.start(SessionId::generate(base), Role::Host)
    }

    /// Join from a share link or a bare session id.
    pub fn join(&mut self, reference: &str) -> Result<SessionId> {
        let id = match SessionId::parse(reference) {
            Ok(id) => id,
            Err(e) => {
                self.notify(StatusUpdate::Failed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        self.start(id, Role::Guest)
    }

    fn start(&mut self, id: SessionId, role: Role) -> Result<SessionId> {
        if self.session.is_some() {
            // Exactly one session at a time.
            self.teardown_link();
            self.session = None;
        }

        let count = match self.relay.join_session(&id) {
            Ok(count) => count,
            Err(e) => {
                self.notify(StatusUpdate::Failed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let mut session = Session::new(id.clone(), role);
        session.members = count;
        self.session = Some(session);
        self.notify(StatusUpdate::SessionStarted {
            id: id.clone(),
            role,
        });
        Ok(id)
    }

    /// Process everything that is ready: relay notices, then the link.
    pub fn tick(&mut self) {
        for notice in self.relay.poll() {
            self.handle(PeerEvent::Relay(notice));
        }

        let (transition, messages) = self.negotiator.drive();
        for data in messages {
            self.handle(PeerEvent::Data(data));
        }
        if let Some(transition) = transition {
            self.handle(PeerEvent::Link(transition));
        }
    }

    /// Dispatch one event by kind.
    pub fn handle(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Relay(RelayNotice::Event(event)) => self.on_relay_event(event),
            PeerEvent::Relay(RelayNotice::Disconnected(reason)) => {
                warn!("Relay lost: {}", reason);
                self.notify(StatusUpdate::RelayLost { reason });
            }
            PeerEvent::Link(Transition::Established) => {
                let flushed = self.channel.flush(&mut self.negotiator);
                self.notify(StatusUpdate::Established { flushed });
            }
            PeerEvent::Link(Transition::Closed) => {
                self.teardown_link();
                self.notify(StatusUpdate::LinkClosed);
            }
            PeerEvent::Data(data) => {
                if let Some(envelope) = self.channel.receive(&data) {
                    debug!(
                        "{} over data channel, sent {} ({})",
                        envelope.action.as_str(),
                        envelope.timestamp(),
                        envelope.latency()
                    );
                    self.game.apply_remote_action(&envelope);
                }
            }
        }
    }

    fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::MembershipUpdate { count } => {
                if let Some(session) = self.session.as_mut() {
                    session.members = count;
                }
                self.notify(StatusUpdate::Membership { count });
            }
            RelayEvent::NegotiateNow { target } => {
                if let Some(session) = self.session.as_mut() {
                    session.peer = Some(target);
                }
                let result = self.negotiator.initiate(target);
                if result.is_ok() {
                    self.notify(StatusUpdate::Negotiating {
                        role: LinkRole::Initiator,
                    });
                }
                self.forward(result);
            }
            RelayEvent::Signal { from, signal } => {
                let was_idle = self.negotiator.state() != NegotiationState::Negotiating;
                let result = self.negotiator.handle_descriptor(from, signal);

                if was_idle && self.negotiator.state() == NegotiationState::Negotiating {
                    if let Some(session) = self.session.as_mut() {
                        session.peer = Some(from);
                    }
                    self.notify(StatusUpdate::Negotiating {
                        role: LinkRole::Responder,
                    });
                }
                self.forward(result);
            }
            RelayEvent::GameAction {
                session_id,
                action,
                payload,
                timestamp,
            } => {
                if self.session.as_ref().map(|s| &s.id) != Some(&session_id) {
                    warn!("Dropping action for foreign session {}", session_id);
                    return;
                }
                let envelope = ActionEnvelope {
                    action,
                    payload,
                    timestamp,
                };
                debug!(
                    "{} via relay, sent {} ({})",
                    action.as_str(),
                    envelope.timestamp(),
                    envelope.latency()
                );
                self.game.apply_remote_action(&envelope);
            }
            RelayEvent::PeerLeft => {
                self.teardown_link();
                if let Some(session) = self.session.as_mut() {
                    session.peer = None;
                    session.members = 1;
                }
                self.notify(StatusUpdate::PeerLeft);
            }
        }
    }

    /// Send negotiation output through the relay, or report the error.
    fn forward(&mut self, result: Result<Vec<Outgoing>>) {
        let outgoing = match result {
            Ok(outgoing) => outgoing,
            Err(e) => return self.report(e),
        };

        for Outgoing { target, descriptor } in outgoing {
            if let Err(e) = self.relay.send_negotiation(target, &descriptor) {
                warn!("Could not forward {} to {}: {}", descriptor.kind(), target, e);
                self.notify(StatusUpdate::Failed {
                    reason: e.to_string(),
                });
                return;
            }
        }
    }

    fn report(&mut self, error: Error) {
        if error.is_ignorable() {
            debug!("Ignored: {}", error);
            return;
        }
        warn!("{}", error);
        self.notify(StatusUpdate::Failed {
            reason: error.to_string(),
        });
    }

    /// Route an envelope over the data channel or the relay.
    pub fn send(&mut self, envelope: ActionEnvelope) -> Result<Route> {
        let session = self.session.as_ref().map(|s| &s.id);
        let result = self
            .channel
            .send(envelope, &mut self.negotiator, &mut self.relay, session);

        if let Err(e) = &result {
            self.notify(StatusUpdate::SendFailed {
                reason: e.to_string(),
            });
        }
        result
    }

    /// Wrap a local action into an envelope and send it.
    pub fn broadcast_local_action(&mut self, action: ActionKind, payload: Value) -> Result<Route> {
        self.send(ActionEnvelope::new(action, payload))
    }

    pub fn broadcast(&mut self, action: &GameAction) -> Result<Route> {
        self.broadcast_local_action(action.kind(), action.payload())
    }

    /// Leave the session. Completes locally whatever the relay says.
    pub fn leave(&mut self) {
        self.teardown_link();
        self.relay.leave();
        if self.session.take().is_some() {
            self.notify(StatusUpdate::Left);
        }
    }

    fn teardown_link(&mut self) {
        self.negotiator.teardown();
        self.channel.discard_queue();
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiator.state()
    }

    /// Actions currently go over the data channel.
    pub fn is_direct(&self) -> bool {
        self.negotiator.is_direct()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn share_link(&self, origin: &str) -> Option<String> {
        self.session.as_ref().map(|s| s.id.share_link(origin))
    }

    pub fn relay(&self) -> &R {
        &self.relay
    }

    pub fn game(&self) -> &G {
        &self.game
    }

    pub fn game_mut(&mut self) -> &mut G {
        &mut self.game
    }

    fn notify(&mut self, update: StatusUpdate) {
        info!("{}", update);
        self.observers.retain(|tx| tx.send(update.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::descriptor::NetworkDescriptor;
    use crate::model::session::ParticipantId;

    #[derive(Default)]
    struct ScriptedRelay {
        connected: bool,
        inbox: Vec<RelayNotice>,
        signals: Vec<(ParticipantId, NetworkDescriptor)>,
        actions: Vec<(SessionId, ActionEnvelope)>,
        joined: Vec<SessionId>,
    }

    impl RelayPort for ScriptedRelay {
        fn local_id(&self) -> ParticipantId {
            ParticipantId(0)
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn join_session(&mut self, session: &SessionId) -> Result<usize> {
            if !self.connected {
                return Err(Error::Connection("unreachable".into()));
            }
            self.joined.push(session.clone());
            Ok(1)
        }

        fn send_negotiation(
            &mut self,
            target: ParticipantId,
            descriptor: &NetworkDescriptor,
        ) -> Result<()> {
            self.signals.push((target, descriptor.clone()));
            Ok(())
        }

        fn send_action(&mut self, session: &SessionId, envelope: &ActionEnvelope) -> Result<()> {
            if !self.connected {
                return Err(Error::ChannelUnavailable);
            }
            self.actions.push((session.clone(), envelope.clone()));
            Ok(())
        }

        fn poll(&mut self) -> Vec<RelayNotice> {
            std::mem::take(&mut self.inbox)
        }

        fn leave(&mut self) {
            self.connected = false;
        }
    }

    #[derive(Default)]
    struct Recorder(Vec<ActionEnvelope>);

    impl GameStateAdapter for Recorder {
        fn apply_remote_action(&mut self, envelope: &ActionEnvelope) {
            self.0.push(envelope.clone());
        }
    }

    fn peer() -> Peer<ScriptedRelay, Recorder> {
        let relay = ScriptedRelay {
            connected: true,
            ..Default::default()
        };
        Peer::new(relay, Recorder::default(), LinkConfig::loopback())
    }

    fn event(event: RelayEvent) -> PeerEvent {
        PeerEvent::Relay(RelayNotice::Event(event))
    }

    #[test]
    fn join_accepts_share_links() {
        let mut peer = peer();
        let id = peer.join("https://example.org/?join=room_1700000000000").unwrap();
        assert_eq!(id.as_str(), "room_1700000000000");
        assert_eq!(peer.relay().joined, vec![id]);
        assert_eq!(peer.session().map(|s| s.role), Some(Role::Guest));
    }

    #[test]
    fn unreachable_relay_fails_join_without_a_session() {
        let mut peer = peer();
        peer.relay.connected = false;
        let status = peer.subscribe();

        assert!(matches!(peer.host(None), Err(Error::Connection(_))));
        assert!(peer.session().is_none());
        assert!(matches!(status.try_recv(), Ok(StatusUpdate::Failed { .. })));
    }

    #[test]
    fn negotiate_now_sends_offer_to_target() {
        let mut peer = peer();
        peer.host(None).unwrap();
        peer.handle(event(RelayEvent::NegotiateNow {
            target: ParticipantId(1),
        }));

        assert_eq!(peer.negotiation_state(), NegotiationState::Negotiating);
        let (target, first) = &peer.relay().signals[0];
        assert_eq!(*target, ParticipantId(1));
        assert!(matches!(first, NetworkDescriptor::Offer { .. }));

        // A repeated trigger changes nothing.
        let sent = peer.relay().signals.len();
        peer.handle(event(RelayEvent::NegotiateNow {
            target: ParticipantId(1),
        }));
        assert_eq!(peer.relay().signals.len(), sent);
    }

    #[test]
    fn unanswered_offer_sends_through_relay() {
        let mut peer = peer();
        let id = peer.host(None).unwrap();
        peer.handle(event(RelayEvent::NegotiateNow {
            target: ParticipantId(1),
        }));

        let route = peer
            .broadcast_local_action(ActionKind::EndTurn, json!({ "player": 2, "turn": 2 }))
            .unwrap();
        assert_eq!(route, Route::Relayed);
        assert_eq!(peer.relay().actions.len(), 1);
        assert_eq!(peer.relay().actions[0].0, id);
    }

    #[test]
    fn relay_loss_during_negotiation_queues_then_fails_after_teardown() {
        let mut peer = peer();
        peer.host(None).unwrap();
        peer.handle(event(RelayEvent::NegotiateNow {
            target: ParticipantId(1),
        }));
        peer.relay.connected = false;
        peer.handle(PeerEvent::Relay(RelayNotice::Disconnected("gone".into())));

        let route = peer.broadcast(&GameAction::chat("hello?")).unwrap();
        assert_eq!(route, Route::Queued);

        peer.handle(event(RelayEvent::PeerLeft));
        assert_eq!(peer.negotiation_state(), NegotiationState::Closed);
        assert!(matches!(
            peer.broadcast(&GameAction::chat("anyone?")),
            Err(Error::ChannelUnavailable)
        ));
        // The session itself survives.
        assert!(peer.session().is_some());
    }

    #[test]
    fn fallback_actions_reach_the_adapter() {
        let mut peer = peer();
        let id = peer.host(None).unwrap();
        peer.handle(event(RelayEvent::GameAction {
            session_id: id,
            action: ActionKind::ChatMessage,
            payload: json!({ "text": "hi" }),
            timestamp: 1,
        }));
        peer.handle(event(RelayEvent::GameAction {
            session_id: SessionId::with_millis("other", 1),
            action: ActionKind::ChatMessage,
            payload: json!({ "text": "not for you" }),
            timestamp: 2,
        }));

        assert_eq!(peer.game().0.len(), 1);
        assert_eq!(peer.game().0[0].payload, json!({ "text": "hi" }));
    }

    #[test]
    fn malformed_direct_data_is_dropped() {
        let mut peer = peer();
        peer.host(None).unwrap();
        peer.handle(PeerEvent::Data(b"{not json".to_vec()));
        peer.handle(PeerEvent::Data(
            br#"{"action":"CHAT_MESSAGE","payload":{"text":"ok"},"timestamp":5}"#.to_vec(),
        ));
        assert_eq!(peer.game().0.len(), 1);
    }

    #[test]
    fn peer_left_marks_session_single_party() {
        let mut peer = peer();
        peer.host(None).unwrap();
        peer.handle(event(RelayEvent::MembershipUpdate { count: 2 }));
        peer.handle(event(RelayEvent::NegotiateNow {
            target: ParticipantId(1),
        }));
        peer.handle(event(RelayEvent::PeerLeft));

        let session = peer.session().unwrap();
        assert_eq!(session.members, 1);
        assert_eq!(session.peer, None);
        assert_eq!(peer.negotiation_state(), NegotiationState::Closed);
    }

    #[test]
    fn leave_drops_session_and_relay() {
        let mut peer = peer();
        let status = peer.subscribe();
        peer.host(Some("castle")).unwrap();
        peer.leave();

        assert!(peer.session().is_none());
        assert!(!peer.relay().is_connected());
        let updates: Vec<StatusUpdate> = status.try_iter().collect();
        assert_eq!(updates.last(), Some(&StatusUpdate::Left));
    }
}
