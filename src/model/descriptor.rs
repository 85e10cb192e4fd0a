//! Negotiation payloads exchanged through the relay while a PeerLink is set up.
//!
//! The JSON shapes match what a browser `RTCPeerConnection` produces, so a
//! native peer and a browser peer can negotiate through the same relay.

use serde::{Deserialize, Serialize};
use str0m::change::{SdpAnswer, SdpOffer};
use str0m::Candidate;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NetworkDescriptor {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: String },
}

impl NetworkDescriptor {
    pub fn offer(offer: &SdpOffer) -> Self {
        NetworkDescriptor::Offer {
            sdp: offer.to_sdp_string(),
        }
    }

    pub fn answer(answer: &SdpAnswer) -> Self {
        NetworkDescriptor::Answer {
            sdp: answer.to_sdp_string(),
        }
    }

    pub fn candidate(candidate: &Candidate) -> Self {
        NetworkDescriptor::Candidate {
            candidate: candidate.to_sdp_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NetworkDescriptor::Offer { .. } => "offer",
            NetworkDescriptor::Answer { .. } => "answer",
            NetworkDescriptor::Candidate { .. } => "candidate",
        }
    }
}

pub(crate) fn parse_offer(sdp: &str) -> Result<SdpOffer> {
    SdpOffer::from_sdp_string(sdp).map_err(|e| Error::MalformedMessage(format!("offer: {e}")))
}

pub(crate) fn parse_answer(sdp: &str) -> Result<SdpAnswer> {
    SdpAnswer::from_sdp_string(sdp).map_err(|e| Error::MalformedMessage(format!("answer: {e}")))
}

pub(crate) fn parse_candidate(candidate: &str) -> Result<Candidate> {
    Candidate::from_sdp_string(candidate)
        .map_err(|e| Error::MalformedMessage(format!("candidate: {e}")))
}
