//! Session negotiator: owns the PeerLink and its lifecycle.
//!
//! ```text
//! Idle --initiate / offer--> Negotiating --channel open--> Established
//!   ^                             |                            |
//!   |                             +------teardown/left---------+--> Closed
//!   +------------- (a new pairing starts a new attempt) -----------+
//! ```
//!
//! The negotiator never talks to the relay itself. Every step returns the
//! descriptors that must be forwarded, and the session controller routes them.
//! Events that do not fit the current state come back as
//! `Error::InvalidTransition`; the caller logs and ignores them.

use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::model::descriptor::NetworkDescriptor;
use crate::model::link::{LinkEvent, PeerLink};
use crate::model::session::ParticipantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Negotiating,
    Established,
    Closed,
}

impl NegotiationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Negotiating => "negotiating",
            NegotiationState::Established => "established",
            NegotiationState::Closed => "closed",
        }
    }
}

/// Which side of the offer/answer exchange this process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Initiator,
    Responder,
}

/// A descriptor that must be forwarded to `target` through the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub target: ParticipantId,
    pub descriptor: NetworkDescriptor,
}

/// Transition reported back from driving the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Established,
    Closed,
}

#[derive(Debug)]
pub struct Negotiator {
    config: LinkConfig,
    state: NegotiationState,
    role: Option<LinkRole>,
    remote: Option<ParticipantId>,
    link: Option<PeerLink>,
    // Candidates that arrived before a remote description was set.
    early_candidates: Vec<(ParticipantId, String)>,
    attempt: u32,
}

impl Negotiator {
    pub fn new(config: LinkConfig) -> Negotiator {
        Self {
            config,
            state: NegotiationState::Idle,
            role: None,
            remote: None,
            link: None,
            early_candidates: Vec::new(),
            attempt: 0,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Option<LinkRole> {
        self.role
    }

    pub fn remote(&self) -> Option<ParticipantId> {
        self.remote
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn buffered_candidates(&self) -> usize {
        self.early_candidates.len()
    }

    /// True when the data channel is established and writable.
    pub fn is_direct(&self) -> bool {
        self.state == NegotiationState::Established && self.link.as_ref().is_some_and(PeerLink::is_open)
    }

    /// Relay told us to initiate towards `target`.
    pub fn initiate(&mut self, target: ParticipantId) -> Result<Vec<Outgoing>> {
        if self.busy() {
            return Err(self.invalid("negotiate-now"));
        }

        let mut link = PeerLink::bind(&self.config)?;
        let offer = link.create_offer()?;
        let candidates = link.local_candidates();
        let local = link.local_addr();

        self.begin(LinkRole::Initiator, target, link);
        info!(
            "Negotiating with {} as initiator on {} (attempt {})",
            target, local, self.attempt
        );

        let mut out = vec![Outgoing {
            target,
            descriptor: offer,
        }];
        out.extend(candidates.into_iter().map(|descriptor| Outgoing { target, descriptor }));
        Ok(out)
    }

    /// Consume one descriptor forwarded by the relay from `from`.
    pub fn handle_descriptor(
        &mut self,
        from: ParticipantId,
        descriptor: NetworkDescriptor,
    ) -> Result<Vec<Outgoing>> {
        match descriptor {
            NetworkDescriptor::Offer { sdp } => self.handle_offer(from, &sdp),
            NetworkDescriptor::Answer { sdp } => self.handle_answer(from, &sdp),
            NetworkDescriptor::Candidate { candidate } => {
                self.handle_candidate(from, candidate)?;
                Ok(Vec::new())
            }
        }
    }

    fn handle_offer(&mut self, from: ParticipantId, sdp: &str) -> Result<Vec<Outgoing>> {
        if self.busy() {
            return Err(self.invalid("offer"));
        }

        let mut link = PeerLink::bind(&self.config)?;
        let answer = link.accept_offer(sdp)?;
        let candidates = link.local_candidates();
        let local = link.local_addr();

        self.begin(LinkRole::Responder, from, link);
        info!(
            "Negotiating with {} as responder on {} (attempt {})",
            from, local, self.attempt
        );
        self.flush_early_candidates();

        let mut out = vec![Outgoing {
            target: from,
            descriptor: answer,
        }];
        out.extend(candidates.into_iter().map(|descriptor| Outgoing {
            target: from,
            descriptor,
        }));
        Ok(out)
    }

    fn handle_answer(&mut self, from: ParticipantId, sdp: &str) -> Result<Vec<Outgoing>> {
        if self.state != NegotiationState::Negotiating
            || self.role != Some(LinkRole::Initiator)
            || self.remote != Some(from)
        {
            return Err(self.invalid("answer"));
        }

        let Some(link) = self.link.as_mut() else {
            return Err(self.invalid("answer"));
        };
        if link.has_remote_description() {
            return Err(self.invalid("answer"));
        }

        link.accept_answer(sdp)?;
        debug!("Answer from {} accepted", from);
        self.flush_early_candidates();
        Ok(Vec::new())
    }

    fn handle_candidate(&mut self, from: ParticipantId, candidate: String) -> Result<()> {
        match self.state {
            NegotiationState::Idle => {
                // Possibly ahead of its offer; keep it for the responder link.
                self.buffer_candidate(from, candidate);
                Ok(())
            }
            NegotiationState::Closed => {
                debug!("Discarding candidate from {} after close", from);
                Ok(())
            }
            NegotiationState::Negotiating | NegotiationState::Established => {
                if self.remote != Some(from) {
                    debug!("Discarding candidate from unexpected participant {}", from);
                    return Ok(());
                }

                let Some(link) = self.link.as_mut() else {
                    return Ok(());
                };

                if !link.has_remote_description() {
                    self.buffer_candidate(from, candidate);
                    return Ok(());
                }

                match link.add_remote_candidate(&candidate) {
                    Ok(true) => debug!("Added remote candidate {}", candidate),
                    Ok(false) => debug!("Duplicate candidate ignored"),
                    Err(e) => return Err(e),
                }
                Ok(())
            }
        }
    }

    /// Drive the link and apply what it reports. Returns the transition, if
    /// any, plus every data channel message that arrived.
    pub fn drive(&mut self) -> (Option<Transition>, Vec<Vec<u8>>) {
        let events = match self.link.as_mut() {
            Some(link) => link.drive(),
            None => return (None, Vec::new()),
        };

        let mut transition = None;
        let mut messages = Vec::new();
        for event in events {
            match event {
                LinkEvent::Data(data) => messages.push(data),
                other => {
                    if let Some(t) = self.on_link_event(other) {
                        transition = Some(t);
                    }
                }
            }
        }

        (transition, messages)
    }

    /// Apply a transport event to the state machine.
    pub fn on_link_event(&mut self, event: LinkEvent) -> Option<Transition> {
        match (event, self.state) {
            (LinkEvent::Open, NegotiationState::Negotiating) => {
                self.state = NegotiationState::Established;
                info!("Data channel established with {:?}", self.remote);
                Some(Transition::Established)
            }
            (LinkEvent::Open, state) => {
                debug!("Ignoring channel open while {}", state.as_str());
                None
            }
            (LinkEvent::Closed, NegotiationState::Negotiating | NegotiationState::Established) => {
                warn!("PeerLink with {:?} closed", self.remote);
                self.teardown();
                Some(Transition::Closed)
            }
            (LinkEvent::Closed, _) | (LinkEvent::Data(_), _) => None,
        }
    }

    /// Write straight to the data channel. `false` when the direct path is
    /// not usable right now.
    pub fn send_direct(&mut self, data: &[u8]) -> bool {
        if self.state != NegotiationState::Established {
            return false;
        }

        match self.link.as_mut() {
            Some(link) => link.write(data),
            None => false,
        }
    }

    /// Release the transport. Safe to call in any state.
    pub fn teardown(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.early_candidates.clear();
        if self.state != NegotiationState::Idle {
            self.state = NegotiationState::Closed;
        }
    }

    fn busy(&self) -> bool {
        matches!(
            self.state,
            NegotiationState::Negotiating | NegotiationState::Established
        )
    }

    fn begin(&mut self, role: LinkRole, remote: ParticipantId, link: PeerLink) {
        self.attempt += 1;
        self.state = NegotiationState::Negotiating;
        self.role = Some(role);
        self.remote = Some(remote);
        self.link = Some(link);
    }

    fn buffer_candidate(&mut self, from: ParticipantId, candidate: String) {
        let entry = (from, candidate);
        if !self.early_candidates.contains(&entry) {
            debug!("Buffering candidate from {} until the remote description is set", from);
            self.early_candidates.push(entry);
        }
    }

    fn flush_early_candidates(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };

        for (from, candidate) in self.early_candidates.drain(..) {
            if Some(from) != self.remote {
                debug!("Dropping buffered candidate from {}", from);
                continue;
            }
            if let Err(e) = link.add_remote_candidate(&candidate) {
                warn!("Dropping buffered candidate: {}", e);
            }
        }
        debug!("{} remote candidates known", link.remote_candidate_count());
    }

    fn invalid(&self, event: &'static str) -> Error {
        Error::InvalidTransition {
            event,
            state: self.state.as_str(),
        }
    }
}
