use std::collections::HashSet;
use std::fmt;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Instant;

use str0m::change::SdpPendingOffer;
use str0m::channel::ChannelId;
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::model::descriptor::{parse_answer, parse_candidate, parse_offer, NetworkDescriptor};
use crate::util::select_host_address;

/// Label of the one data channel game actions travel on.
pub const CHANNEL_LABEL: &str = "gameData";

/// What the negotiator needs to know after driving the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The data channel is open and writable.
    Open,
    /// One message arrived on the data channel.
    Data(Vec<u8>),
    /// The transport went away.
    Closed,
}

/// The direct transport to the other participant: a str0m `Rtc` plus the UDP
/// socket it talks through.
pub struct PeerLink {
    rtc: Rtc,
    socket: UdpSocket,
    local: SocketAddr,
    candidate: Candidate,
    pending: Option<SdpPendingOffer>,
    cid: Option<ChannelId>,
    remote_described: bool,
    remote_candidates: HashSet<String>,
    open: bool,
    closed: bool,
    buf: Vec<u8>,
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("local", &self.local)
            .field("cid", &self.cid)
            .field("open", &self.open)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl PeerLink {
    /// Bind a socket on the configured interface and register it as the only
    /// local host candidate.
    pub fn bind(config: &LinkConfig) -> Result<PeerLink> {
        let host = if config.loopback {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            match config.host {
                Some(host) => host,
                None => select_host_address()?,
            }
        };

        let socket = UdpSocket::bind(SocketAddr::new(host, 0))?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        info!("Bound UDP port: {}", local);

        let candidate = Candidate::host(local, Protocol::Udp)
            .map_err(|e| Error::Negotiation(format!("host candidate: {e}")))?;

        let mut rtc = Rtc::new();
        let _ = rtc.add_local_candidate(candidate.clone());

        Ok(PeerLink {
            rtc,
            socket,
            local,
            candidate,
            pending: None,
            cid: None,
            remote_described: false,
            remote_candidates: HashSet::new(),
            open: false,
            closed: false,
            buf: vec![0; 2000],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Local candidates to trickle to the other side.
    pub fn local_candidates(&self) -> Vec<NetworkDescriptor> {
        vec![NetworkDescriptor::candidate(&self.candidate)]
    }

    /// Initiator side: add the game channel and produce an offer.
    pub fn create_offer(&mut self) -> Result<NetworkDescriptor> {
        let mut change = self.rtc.sdp_api();
        let cid = change.add_channel(CHANNEL_LABEL.to_string());

        let (offer, pending) = change
            .apply()
            .ok_or_else(|| Error::Negotiation("sdp change produced no offer".into()))?;

        debug!("Requested data channel '{}' with ID: {:?}", CHANNEL_LABEL, cid);
        self.cid = Some(cid);
        self.pending = Some(pending);

        Ok(NetworkDescriptor::offer(&offer))
    }

    /// Responder side: accept the remote offer and produce the answer.
    pub fn accept_offer(&mut self, sdp: &str) -> Result<NetworkDescriptor> {
        let offer = parse_offer(sdp)?;
        let answer = self
            .rtc
            .sdp_api()
            .accept_offer(offer)
            .map_err(|e| Error::Negotiation(format!("accept offer: {e}")))?;

        self.remote_described = true;
        Ok(NetworkDescriptor::answer(&answer))
    }

    /// Initiator side: complete the offer/answer exchange.
    pub fn accept_answer(&mut self, sdp: &str) -> Result<()> {
        let answer = parse_answer(sdp)?;
        let Some(pending) = self.pending.take() else {
            return Err(Error::InvalidTransition {
                event: "answer",
                state: "no offer pending",
            });
        };

        self.rtc
            .sdp_api()
            .accept_answer(pending, answer)
            .map_err(|e| Error::Negotiation(format!("accept answer: {e}")))?;

        self.remote_described = true;
        Ok(())
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_described
    }

    /// Returns `false` for a candidate that was already added.
    pub fn add_remote_candidate(&mut self, candidate: &str) -> Result<bool> {
        if self.remote_candidates.contains(candidate) {
            return Ok(false);
        }

        let parsed = parse_candidate(candidate)?;
        self.rtc.add_remote_candidate(parsed);
        self.remote_candidates.insert(candidate.to_string());
        Ok(true)
    }

    pub fn remote_candidate_count(&self) -> usize {
        self.remote_candidates.len()
    }

    pub fn is_open(&self) -> bool {
        self.open && !self.closed && self.rtc.is_alive()
    }

    /// Write one message to the data channel. `false` means the caller must
    /// route it elsewhere.
    pub fn write(&mut self, data: &[u8]) -> bool {
        if !self.is_open() {
            return false;
        }

        let Some(mut channel) = self.cid.and_then(|id| self.rtc.channel(id)) else {
            return false;
        };

        match channel.write(false, data) {
            Ok(_) => true,
            Err(e) => {
                warn!("Data channel write failed: {:?}", e);
                false
            }
        }
    }

    /// Drive the state machine: flush outgoing datagrams, feed incoming ones,
    /// and advance timers until str0m has nothing due right now.
    pub fn drive(&mut self) -> Vec<LinkEvent> {
        let mut events = Vec::new();

        loop {
            if !self.rtc.is_alive() {
                if !self.closed {
                    self.closed = true;
                    events.push(LinkEvent::Closed);
                }
                break;
            }

            let timeout = match self.rtc.poll_output() {
                Ok(Output::Timeout(t)) => t,
                Ok(Output::Transmit(transmit)) => {
                    if let Err(e) = self.socket.send_to(&transmit.contents, transmit.destination) {
                        debug!("UDP send to {} failed: {}", transmit.destination, e);
                    }
                    continue;
                }
                Ok(Output::Event(event)) => {
                    if let Some(event) = self.handle_event(event) {
                        events.push(event);
                    }
                    continue;
                }
                Err(e) => {
                    warn!("PeerLink poll_output failed: {:?}", e);
                    self.rtc.disconnect();
                    continue;
                }
            };

            if let Some(input) = read_socket_input(&self.socket, self.local, &mut self.buf) {
                if let Err(e) = self.rtc.handle_input(input) {
                    warn!("PeerLink disconnected: {:?}", e);
                    self.rtc.disconnect();
                }
                continue;
            }

            let now = Instant::now();
            if timeout > now {
                break;
            }

            if let Err(e) = self.rtc.handle_input(Input::Timeout(now)) {
                warn!("PeerLink disconnected: {:?}", e);
                self.rtc.disconnect();
            }
        }

        events
    }

    /// Best-effort close. The socket is released when the link is dropped.
    pub fn close(&mut self) {
        self.rtc.disconnect();
        self.open = false;
        self.closed = true;
    }

    fn handle_event(&mut self, event: Event) -> Option<LinkEvent> {
        match event {
            Event::IceConnectionStateChange(state) => {
                info!("ICE Connection State: {:?}", state);
                if state == IceConnectionState::Disconnected {
                    // No ICE restart; a lost path closes the link.
                    self.rtc.disconnect();
                    return self.mark_closed();
                }
                None
            }
            Event::ChannelOpen(cid, label) => {
                if label != CHANNEL_LABEL {
                    debug!("Ignoring channel '{}' ({:?})", label, cid);
                    return None;
                }
                info!("Channel opened - Name: '{}', ID: {:?}", label, cid);
                self.cid = Some(cid);
                if self.open {
                    return None;
                }
                self.open = true;
                Some(LinkEvent::Open)
            }
            Event::ChannelData(data) => {
                if Some(data.id) != self.cid {
                    return None;
                }
                Some(LinkEvent::Data(data.data))
            }
            Event::ChannelClose(cid) => {
                if Some(cid) != self.cid {
                    return None;
                }
                self.mark_closed()
            }
            _ => None,
        }
    }

    fn mark_closed(&mut self) -> Option<LinkEvent> {
        self.open = false;
        if self.closed {
            return None;
        }
        self.closed = true;
        Some(LinkEvent::Closed)
    }
}

fn read_socket_input<'a>(
    socket: &UdpSocket,
    destination: SocketAddr,
    buf: &'a mut Vec<u8>,
) -> Option<Input<'a>> {
    buf.resize(2000, 0);

    match socket.recv_from(buf) {
        Ok((n, source)) => {
            buf.truncate(n);

            // Parse data to a DatagramRecv, which demultiplexes STUN, DTLS and
            // the rest sharing the one port.
            let Ok(contents) = buf.as_slice().try_into() else {
                return None;
            };

            Some(Input::Receive(
                Instant::now(),
                Receive {
                    proto: Protocol::Udp,
                    source,
                    destination,
                    contents,
                },
            ))
        }
        Err(e) => {
            if !matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) {
                debug!("UDP read failed: {}", e);
            }
            None
        }
    }
}
