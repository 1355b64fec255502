//! IPv4 hop addresses as they appear in measured paths.
//!
//! A [`Hop`] is a thin wrapper around [`Ipv4Addr`] with the conventions the
//! measurement pipeline relies on: the all-zeros address stands for an
//! unknown/unresponsive hop, and non-routable addresses (private ranges,
//! loopback, link-local, CGNAT) are treated as unknown when they show up in
//! inferred paths, since no probe can be usefully aimed at them.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One hop in a measured or inferred path.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hop(Ipv4Addr);

impl Hop {
    /// The unknown-hop sentinel (`0.0.0.0`).
    pub const UNKNOWN: Hop = Hop(Ipv4Addr::UNSPECIFIED);

    pub fn new(addr: Ipv4Addr) -> Self {
        Hop(addr)
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.0
    }

    pub fn is_unknown(&self) -> bool {
        self.0.is_unspecified()
    }

    /// True when the address cannot be probed from the public internet:
    /// unspecified, loopback, link-local, multicast, broadcast, RFC 1918
    /// private space, or the CGNAT range (100.64.0.0/10).
    pub fn is_private(&self) -> bool {
        let a = self.0;
        let o = a.octets();
        a.is_unspecified()
            || a.is_loopback()
            || a.is_link_local()
            || a.is_multicast()
            || a.is_broadcast()
            || a.is_private()
            || (o[0] == 100 && (o[1] & 0xc0) == 64)
    }

    /// Replaces non-routable addresses with [`Hop::UNKNOWN`]; routable
    /// addresses pass through unchanged.
    pub fn normalized(self) -> Hop {
        if self.is_private() {
            Hop::UNKNOWN
        } else {
            self
        }
    }

    /// The enclosing /24, as used for adjacency-to-destination lookups and
    /// spoofer ranking.
    pub fn prefix24(&self) -> u32 {
        u32::from(self.0) >> 8
    }
}

impl From<u32> for Hop {
    fn from(v: u32) -> Self {
        Hop(Ipv4Addr::from(v))
    }
}

impl From<Hop> for u32 {
    fn from(h: Hop) -> Self {
        u32::from(h.0)
    }
}

impl From<Ipv4Addr> for Hop {
    fn from(a: Ipv4Addr) -> Self {
        Hop(a)
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            write!(f, "*")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl fmt::Debug for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Error parsing a hop from text.
#[derive(Debug, thiserror::Error)]
#[error("invalid hop address: {0}")]
pub struct ParseHopError(String);

impl FromStr for Hop {
    type Err = ParseHopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(Hop::UNKNOWN);
        }
        s.parse::<Ipv4Addr>()
            .map(Hop)
            .map_err(|_| ParseHopError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(s: &str) -> Hop {
        s.parse().unwrap()
    }

    #[test]
    fn unknown_displays_as_star() {
        assert_eq!(Hop::UNKNOWN.to_string(), "*");
        assert_eq!(h("*"), Hop::UNKNOWN);
    }

    #[test]
    fn private_classification() {
        assert!(h("10.1.2.3").is_private());
        assert!(h("172.16.9.9").is_private());
        assert!(h("192.168.0.1").is_private());
        assert!(h("100.64.0.1").is_private());
        assert!(h("127.0.0.1").is_private());
        assert!(Hop::UNKNOWN.is_private());
        assert!(!h("8.8.8.8").is_private());
        assert!(!h("129.10.113.189").is_private());
    }

    #[test]
    fn normalize_maps_private_to_unknown() {
        assert_eq!(h("192.168.1.1").normalized(), Hop::UNKNOWN);
        assert_eq!(h("8.8.8.8").normalized(), h("8.8.8.8"));
    }

    #[test]
    fn prefix24_drops_last_octet() {
        assert_eq!(h("1.2.3.4").prefix24(), h("1.2.3.99").prefix24());
        assert_ne!(h("1.2.3.4").prefix24(), h("1.2.4.4").prefix24());
    }

    #[test]
    fn u32_round_trip() {
        let hop = h("129.10.113.189");
        assert_eq!(Hop::from(u32::from(hop)), hop);
    }
}
