//! Relay-side membership and mailbox state.
//!
//! `Registry` is the data structure the relay server drives. Every participant
//! gets a mailbox of pending `RelayEvent`s that its long-poll drains. All
//! mutation happens under the server's single lock; nothing here blocks or
//! touches the network, so the routing rules are tested directly.
//!
//! Initiator rule: the first member of a session is told to negotiate when the
//! second one arrives. Exactly one `NegotiateNow` is emitted per pairing.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::descriptor::NetworkDescriptor;
use crate::model::session::{ParticipantId, SessionId};
use crate::model::wire::{ActionRequest, RelayEvent};

pub const SESSION_CAPACITY: usize = 2;

#[derive(Debug)]
struct Mailbox {
    session: Option<SessionId>,
    queue: VecDeque<RelayEvent>,
    last_seen: Instant,
    polling: usize,
}

#[derive(Debug, Default)]
pub struct Registry {
    participants: HashMap<ParticipantId, Mailbox>,
    // Members in join order; index 0 is the initiator.
    sessions: HashMap<SessionId, Vec<ParticipantId>>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn connect(&mut self, now: Instant) -> ParticipantId {
        let id = ParticipantId(self.next_id);
        self.next_id += 1;
        self.participants.insert(
            id,
            Mailbox {
                session: None,
                queue: VecDeque::new(),
                last_seen: now,
                polling: 0,
            },
        );
        info!("Participant {} connected", id);
        id
    }

    pub fn is_connected(&self, id: ParticipantId) -> bool {
        self.participants.contains_key(&id)
    }

    /// Add `id` to `session` and return the new member count.
    pub fn join(&mut self, id: ParticipantId, session: SessionId) -> Result<usize> {
        let current = match self.participants.get(&id) {
            Some(mailbox) => mailbox.session.clone(),
            None => return Err(Error::Connection(format!("unknown participant {id}"))),
        };

        if current.as_ref() == Some(&session) {
            return Ok(self.members(&session).len());
        }

        if self.members(&session).len() >= SESSION_CAPACITY {
            return Err(Error::SessionFull(session.to_string()));
        }

        if current.is_some() {
            self.detach(id);
        }

        let members = self.sessions.entry(session.clone()).or_default();
        members.push(id);
        let members = members.clone();
        if let Some(mailbox) = self.participants.get_mut(&id) {
            mailbox.session = Some(session.clone());
        }

        let count = members.len();
        info!("Participant {} joined {} ({}/{})", id, session, count, SESSION_CAPACITY);
        for member in &members {
            self.push(*member, RelayEvent::MembershipUpdate { count });
        }

        if count == SESSION_CAPACITY {
            let (initiator, responder) = (members[0], members[1]);
            self.push(initiator, RelayEvent::NegotiateNow { target: responder });
        }

        Ok(count)
    }

    /// Forward a descriptor to `target`. The target must share a session with
    /// the sender.
    pub fn signal(
        &mut self,
        from: ParticipantId,
        target: ParticipantId,
        signal: NetworkDescriptor,
    ) -> Result<()> {
        let session = self.session_of(from);
        if session.is_none() || session != self.session_of(target) {
            return Err(Error::Connection(format!(
                "{target} is not in a session with {from}"
            )));
        }

        debug!("Forwarding {} from {} to {}", signal.kind(), from, target);
        self.push(target, RelayEvent::Signal { from, signal });
        Ok(())
    }

    /// Fan a fallback action out to every other member. Returns how many
    /// mailboxes received it.
    pub fn action(&mut self, from: ParticipantId, request: ActionRequest) -> Result<usize> {
        if self.session_of(from).as_ref() != Some(&request.session_id) {
            return Err(Error::Connection(format!(
                "{from} is not a member of {}",
                request.session_id
            )));
        }

        let others: Vec<ParticipantId> = self
            .members(&request.session_id)
            .iter()
            .copied()
            .filter(|m| *m != from)
            .collect();

        let event = RelayEvent::game_action(request.session_id.clone(), request.into_envelope());
        for other in &others {
            self.push(*other, event.clone());
        }

        Ok(others.len())
    }

    pub fn leave(&mut self, id: ParticipantId) {
        if self.participants.contains_key(&id) {
            self.detach(id);
            self.participants.remove(&id);
            info!("Participant {} left", id);
        }
    }

    /// Drain the mailbox. `None` means the participant is gone.
    pub fn take(&mut self, id: ParticipantId, now: Instant) -> Option<Vec<RelayEvent>> {
        let mailbox = self.participants.get_mut(&id)?;
        mailbox.last_seen = now;
        Some(mailbox.queue.drain(..).collect())
    }

    pub fn has_pending(&self, id: ParticipantId) -> bool {
        self.participants
            .get(&id)
            .is_some_and(|m| !m.queue.is_empty())
    }

    pub fn begin_poll(&mut self, id: ParticipantId) {
        if let Some(mailbox) = self.participants.get_mut(&id) {
            mailbox.polling += 1;
        }
    }

    pub fn end_poll(&mut self, id: ParticipantId, now: Instant) {
        if let Some(mailbox) = self.participants.get_mut(&id) {
            mailbox.polling = mailbox.polling.saturating_sub(1);
            mailbox.last_seen = now;
        }
    }

    /// Drop participants that stopped polling more than `liveness` ago.
    pub fn reap(&mut self, now: Instant, liveness: Duration) -> Vec<ParticipantId> {
        let stale: Vec<ParticipantId> = self
            .participants
            .iter()
            .filter(|(_, m)| m.polling == 0 && now.saturating_duration_since(m.last_seen) > liveness)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            info!("Participant {} timed out", id);
            self.leave(*id);
        }

        stale
    }

    pub fn members(&self, session: &SessionId) -> &[ParticipantId] {
        self.sessions.get(session).map(Vec::as_slice).unwrap_or(&[])
    }

    fn session_of(&self, id: ParticipantId) -> Option<SessionId> {
        self.participants.get(&id).and_then(|m| m.session.clone())
    }

    /// Remove `id` from its session and tell whoever remains.
    fn detach(&mut self, id: ParticipantId) {
        let Some(session) = self.participants.get_mut(&id).and_then(|m| m.session.take()) else {
            return;
        };

        let Some(members) = self.sessions.get_mut(&session) else {
            return;
        };
        members.retain(|m| *m != id);
        let remaining = members.clone();

        if remaining.is_empty() {
            self.sessions.remove(&session);
            return;
        }

        let count = remaining.len();
        for member in remaining {
            self.push(member, RelayEvent::PeerLeft);
            self.push(member, RelayEvent::MembershipUpdate { count });
        }
    }

    fn push(&mut self, id: ParticipantId, event: RelayEvent) {
        if let Some(mailbox) = self.participants.get_mut(&id) {
            mailbox.queue.push_back(event);
        }
    }
}
