//! Runtime settings for the three roles a process can play.
//!
//! The binary fills these from `clap` flags (with environment fallbacks);
//! tests build them directly from the `Default` impls.

use std::net::IpAddr;
use std::time::Duration;

/// Relay service settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the HTTP listener binds, e.g. `0.0.0.0:3000`. Port 0 picks a
    /// free port.
    pub bind: String,
    /// Longest a poll may be held open while the mailbox is empty.
    pub poll_wait: Duration,
    /// A participant that has not polled for this long is treated as gone.
    pub liveness: Duration,
    /// Worker threads. Each waiting poll occupies one.
    pub workers: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".into(),
            poll_wait: Duration::from_secs(20),
            liveness: Duration::from_secs(30),
            workers: 16,
        }
    }
}

/// Relay client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the relay, without a trailing slash.
    pub relay_url: String,
    /// How long each poll asks the relay to wait for events.
    pub poll_wait: Duration,
    /// Timeout for the short request/reply calls.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://127.0.0.1:3000".into(),
            poll_wait: Duration::from_secs(20),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into().trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }
}

/// Direct transport settings.
#[derive(Debug, Clone, Default)]
pub struct LinkConfig {
    /// Only offer the loopback interface. For local play and tests.
    pub loopback: bool,
    /// Offer this address instead of auto-detecting one.
    pub host: Option<IpAddr>,
}

impl LinkConfig {
    pub fn loopback() -> Self {
        Self {
            loopback: true,
            host: None,
        }
    }
}
