//! Action channel: one send/receive contract over two paths.
//!
//! Sends go over the data channel when it is established and writable,
//! otherwise through the relay. A closed data channel is noticed inside the
//! same `send` call and the action is rerouted, never retried on the dead path.
//! Nothing is ordered across the two paths, so receivers must tolerate
//! duplicates and stale actions.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::client::RelayPort;
use crate::error::{Error, Result};
use crate::model::payload::ActionEnvelope;
use crate::model::session::SessionId;
use crate::negotiator::{NegotiationState, Negotiator};

/// Actions held back while a negotiation is in flight and the relay is down.
const MAX_QUEUED: usize = 64;

/// Where a sent action went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Relayed,
    /// Held until the data channel opens.
    Queued,
}

/// The direct half of the channel. Implemented by the negotiator, which owns
/// the data channel.
pub trait DirectPath {
    /// Write one serialized envelope. `false` if the path is not usable.
    fn write_direct(&mut self, data: &[u8]) -> bool;

    /// A direct path may still appear.
    fn is_negotiating(&self) -> bool;
}

impl DirectPath for Negotiator {
    fn write_direct(&mut self, data: &[u8]) -> bool {
        self.send_direct(data)
    }

    fn is_negotiating(&self) -> bool {
        self.state() == NegotiationState::Negotiating
    }
}

#[derive(Debug, Default)]
pub struct ActionChannel {
    queued: VecDeque<ActionEnvelope>,
}

impl ActionChannel {
    pub fn new() -> ActionChannel {
        ActionChannel::default()
    }

    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    /// Route one envelope. Never blocks on the network beyond the relay's
    /// request timeout and never panics.
    pub fn send<D, R>(
        &mut self,
        envelope: ActionEnvelope,
        direct: &mut D,
        relay: &mut R,
        session: Option<&SessionId>,
    ) -> Result<Route>
    where
        D: DirectPath,
        R: RelayPort + ?Sized,
    {
        let bytes = envelope.encode()?;
        if direct.write_direct(&bytes) {
            debug!("Sent {} directly", envelope.action.as_str());
            return Ok(Route::Direct);
        }

        if let Some(session) = session {
            if relay.is_connected() {
                match relay.send_action(session, &envelope) {
                    Ok(()) => {
                        debug!("Sent {} via relay", envelope.action.as_str());
                        return Ok(Route::Relayed);
                    }
                    Err(e) => warn!("Relay fallback failed: {}", e),
                }
            }
        }

        if direct.is_negotiating() && self.queued.len() < MAX_QUEUED {
            debug!("Queued {} until the data channel opens", envelope.action.as_str());
            self.queued.push_back(envelope);
            return Ok(Route::Queued);
        }

        Err(Error::ChannelUnavailable)
    }

    /// Push queued actions over the freshly opened data channel. Returns how
    /// many went out.
    pub fn flush<D: DirectPath>(&mut self, direct: &mut D) -> usize {
        let mut sent = 0;
        while let Some(envelope) = self.queued.pop_front() {
            let written = match envelope.encode() {
                Ok(bytes) => direct.write_direct(&bytes),
                Err(e) => {
                    warn!("Dropping queued action: {}", e);
                    continue;
                }
            };

            if !written {
                self.queued.push_front(envelope);
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Forget queued actions after a teardown.
    pub fn discard_queue(&mut self) -> usize {
        let dropped = self.queued.len();
        if dropped > 0 {
            warn!("Discarding {} queued actions", dropped);
        }
        self.queued.clear();
        dropped
    }

    /// Decode one inbound data channel message. Malformed input is logged and
    /// dropped.
    pub fn receive(&self, bytes: &[u8]) -> Option<ActionEnvelope> {
        match ActionEnvelope::decode(bytes) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!(
                    "Dropping data channel message ({}): {}",
                    e,
                    String::from_utf8_lossy(bytes)
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::client::RelayNotice;
    use crate::model::descriptor::NetworkDescriptor;
    use crate::model::payload::ActionKind;
    use crate::model::session::ParticipantId;

    #[derive(Default)]
    struct FakeDirect {
        open: bool,
        negotiating: bool,
        written: Vec<Vec<u8>>,
    }

    impl DirectPath for FakeDirect {
        fn write_direct(&mut self, data: &[u8]) -> bool {
            if self.open {
                self.written.push(data.to_vec());
            }
            self.open
        }

        fn is_negotiating(&self) -> bool {
            self.negotiating
        }
    }

    #[derive(Default)]
    struct FakeRelay {
        connected: bool,
        actions: Vec<(SessionId, ActionEnvelope)>,
    }

    impl RelayPort for FakeRelay {
        fn local_id(&self) -> ParticipantId {
            ParticipantId(0)
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn join_session(&mut self, _session: &SessionId) -> Result<usize> {
            Ok(1)
        }

        fn send_negotiation(
            &mut self,
            _target: ParticipantId,
            _descriptor: &NetworkDescriptor,
        ) -> Result<()> {
            Ok(())
        }

        fn send_action(&mut self, session: &SessionId, envelope: &ActionEnvelope) -> Result<()> {
            self.actions.push((session.clone(), envelope.clone()));
            Ok(())
        }

        fn poll(&mut self) -> Vec<RelayNotice> {
            Vec::new()
        }

        fn leave(&mut self) {
            self.connected = false;
        }
    }

    fn end_turn() -> ActionEnvelope {
        ActionEnvelope::new(ActionKind::EndTurn, json!({ "player": 2, "turn": 2 }))
    }

    fn session() -> SessionId {
        SessionId::with_millis("room", 1_700_000_000_000)
    }

    #[test]
    fn prefers_the_open_data_channel() {
        let mut channel = ActionChannel::new();
        let mut direct = FakeDirect {
            open: true,
            ..Default::default()
        };
        let mut relay = FakeRelay {
            connected: true,
            ..Default::default()
        };

        let route = channel
            .send(end_turn(), &mut direct, &mut relay, Some(&session()))
            .unwrap();
        assert_eq!(route, Route::Direct);
        assert_eq!(direct.written.len(), 1);
        assert!(relay.actions.is_empty());
    }

    #[test]
    fn falls_back_to_the_relay() {
        let mut channel = ActionChannel::new();
        let mut direct = FakeDirect::default();
        let mut relay = FakeRelay {
            connected: true,
            ..Default::default()
        };

        let route = channel
            .send(end_turn(), &mut direct, &mut relay, Some(&session()))
            .unwrap();
        assert_eq!(route, Route::Relayed);
        assert_eq!(relay.actions.len(), 1);
        assert_eq!(relay.actions[0].0, session());
        assert_eq!(relay.actions[0].1.action, ActionKind::EndTurn);
    }

    #[test]
    fn unavailable_when_both_paths_are_down() {
        let mut channel = ActionChannel::new();
        let mut direct = FakeDirect::default();
        let mut relay = FakeRelay::default();

        let result = channel.send(end_turn(), &mut direct, &mut relay, Some(&session()));
        assert!(matches!(result, Err(Error::ChannelUnavailable)));

        // No session at all is the same failure.
        relay.connected = true;
        let result = channel.send(end_turn(), &mut direct, &mut relay, None);
        assert!(matches!(result, Err(Error::ChannelUnavailable)));
    }

    #[test]
    fn queues_while_negotiating_and_flushes_on_open() {
        let mut channel = ActionChannel::new();
        let mut direct = FakeDirect {
            negotiating: true,
            ..Default::default()
        };
        let mut relay = FakeRelay::default();

        let route = channel
            .send(end_turn(), &mut direct, &mut relay, Some(&session()))
            .unwrap();
        assert_eq!(route, Route::Queued);
        assert_eq!(channel.queued(), 1);

        // Still closed: nothing leaves the queue.
        assert_eq!(channel.flush(&mut direct), 0);
        assert_eq!(channel.queued(), 1);

        direct.open = true;
        assert_eq!(channel.flush(&mut direct), 1);
        assert_eq!(channel.queued(), 0);
        assert_eq!(direct.written.len(), 1);
    }

    #[test]
    fn malformed_input_is_dropped() {
        let channel = ActionChannel::new();
        assert!(channel.receive(b"not json").is_none());
        assert!(channel.receive(br#"{"action":"END_TURN"}"#).is_some());
    }
}
