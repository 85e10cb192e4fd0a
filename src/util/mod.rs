use std::net::IpAddr;

use local_ip_address::list_afinet_netifas;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Install the fmt subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init_log() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Pick an IPv4 address that can be shared with a remote ICE peer.
///
/// Iterates over the host's interfaces, skipping loopback, link-local and
/// broadcast addresses. The first routable address wins.
///
/// ## Errors
///
/// `Error::NoCandidates` when the host exposes no usable IPv4 address. Local
/// play can still use the loopback interface via `LinkConfig::loopback`.
pub fn select_host_address() -> Result<IpAddr> {
    let interfaces = list_afinet_netifas().map_err(|e| {
        debug!("Listing network interfaces failed: {}", e);
        Error::NoCandidates
    })?;

    for (name, ip) in interfaces {
        if let IpAddr::V4(v4) = ip {
            if !v4.is_loopback() && !v4.is_link_local() && !v4.is_broadcast() {
                info!("iface: {} / {:?}", name, ip);
                return Ok(ip);
            }
        }
    }

    Err(Error::NoCandidates)
}

/// Milliseconds since the epoch, the unit every timestamp on the wire uses.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
