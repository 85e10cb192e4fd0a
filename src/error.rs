//! Error taxonomy shared by the relay, the negotiator and the action channel.
//!
//! None of these are fatal to the process. Callers log them and surface the
//! `Display` text as a status line.

use thiserror::Error;

/// Errors that can occur during session setup and action delivery.
#[derive(Debug, Error)]
pub enum Error {
    /// The relay endpoint could not be reached or refused the request.
    #[error("relay connection failed: {0}")]
    Connection(String),

    /// Neither the data channel nor the relay can carry the message.
    #[error("no channel available to send on")]
    ChannelUnavailable,

    /// A payload arrived that could not be decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A negotiation event arrived in a state that cannot consume it.
    #[error("{event} is not valid while {state}")]
    InvalidTransition {
        event: &'static str,
        state: &'static str,
    },

    /// str0m rejected an SDP or candidate.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// No usable network interface to offer as a candidate.
    #[error("no usable local ICE candidates")]
    NoCandidates,

    /// The session already has two participants.
    #[error("session {0} is full")]
    SessionFull(String),

    /// An empty or unusable session reference.
    #[error("invalid session reference: {0:?}")]
    InvalidSession(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors that just mean "ignored": logged at debug level, never surfaced.
    pub fn is_ignorable(&self) -> bool {
        matches!(self, Error::InvalidTransition { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
