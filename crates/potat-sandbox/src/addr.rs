//! Private-address classification for outbound requests.
//!
//! The fetch bridge consults this twice per request: once on the URL's
//! literal host before any connection attempt, and once per resolved DNS
//! answer inside the guarded resolver. A name that resolves to a mix of
//! public and private records is rejected outright.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

/// A hostname or literal address inside a blocked range.
///
/// Implements `std::error::Error` so it can travel through reqwest's
/// resolver and redirect error chains and be recovered by downcast.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("BlockedAddress: {0}")]
pub struct BlockedAddress(pub String);

/// Returns true when `host` is a textual IP inside a blocked range.
///
/// DNS names are not classified here; resolved answers are checked
/// individually by the bridge's resolver.
pub fn is_blocked(host: &str) -> bool {
    // IPv6 literals arrive bracketed from URL hosts.
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    match trimmed.parse::<IpAddr>() {
        Ok(ip) => ip_is_blocked(ip),
        Err(_) => false,
    }
}

/// Range check on an already-parsed address.
pub fn ip_is_blocked(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4_is_blocked(v4),
        IpAddr::V6(v6) => v6_is_blocked(v6),
    }
}

fn v4_is_blocked(ip: Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_unspecified()
        || ip.octets()[0] >= 240 // 240/4 reserved
}

fn v6_is_blocked(ip: Ipv6Addr) -> bool {
    // ::ffff:a.b.c.d carries an IPv4 address; classify it as one.
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return v4_is_blocked(mapped);
    }
    let seg = ip.segments();
    ip.is_loopback()
        || ip.is_unspecified()
        || (seg[0] & 0xffc0) == 0xfe80 // fe80::/10 link-local
        || (seg[0] & 0xfe00) == 0xfc00 // fc00::/7 unique-local
}

/// Fails when `host` is a blocked IP literal. Names pass through untouched.
pub fn guard_or_fail(host: &str) -> Result<(), BlockedAddress> {
    if is_blocked(host) {
        return Err(BlockedAddress(host.to_string()));
    }
    Ok(())
}
