use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::now_millis;

/// Query parameter carrying the session id in a share link.
pub const JOIN_PARAM: &str = "?join=";

/// Relay-assigned identity of one connected participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub u64);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Build a fresh id for a hosted match: `<base>_<unix millis>`.
    pub fn generate(base: Option<&str>) -> SessionId {
        let base = base.map(str::trim).filter(|b| !b.is_empty()).unwrap_or("room");
        SessionId::with_millis(base, now_millis())
    }

    pub fn with_millis(base: &str, millis: i64) -> SessionId {
        SessionId(format!("{base}_{millis}"))
    }

    /// Accepts either a full share link or a bare session id.
    pub fn parse(reference: &str) -> Result<SessionId> {
        let reference = reference.trim();
        let id = match reference.split_once(JOIN_PARAM) {
            Some((_, rest)) => rest.split(['&', '#']).next().unwrap_or_default(),
            None => reference,
        };

        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(Error::InvalidSession(reference.to_string()));
        }

        Ok(SessionId(id.to_string()))
    }

    /// `origin` is everything before the query string, e.g. `https://host/game.html`.
    pub fn share_link(&self, origin: &str) -> String {
        format!("{origin}{JOIN_PARAM}{}", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who created the session. This is not the negotiation role; the relay
/// decides who initiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Guest,
}

/// The one active match attempt of this process.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub role: Role,
    pub members: usize,
    pub peer: Option<ParticipantId>,
}

impl Session {
    pub fn new(id: SessionId, role: Role) -> Session {
        Self {
            id,
            role,
            members: 0,
            peer: None,
        }
    }
}
