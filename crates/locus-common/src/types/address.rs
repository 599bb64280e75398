//! Peer addresses.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_PORT;
use crate::error::{LocusError, LocusResult};

/// The listening address of a peer.
///
/// Textual forms: `A.B.C.D[:port]` for IPv4, `[addr][:port]` for IPv6.
/// The port defaults to 7777 when omitted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(SocketAddr);

impl Address {
    /// Creates an address from a socket address.
    #[inline]
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    /// The IPv6 wildcard address on the default port.
    #[must_use]
    pub fn any() -> Self {
        Self(SocketAddr::new(
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            DEFAULT_PORT,
        ))
    }

    /// Returns the underlying socket address.
    #[inline]
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    /// Returns the port.
    #[inline]
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }
}

impl FromStr for Address {
    type Err = LocusError;

    fn from_str(s: &str) -> LocusResult<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(LocusError::invalid_argument("empty address"));
        }

        // full socket address first
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self(addr));
        }
        // bare IP (v4 or bracketless v6), default port
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Self(SocketAddr::new(ip, DEFAULT_PORT)));
        }
        // bracketed v6 without a port
        if let Some(inner) = s.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if let Ok(ip) = inner.parse::<Ipv6Addr>() {
                return Ok(Self(SocketAddr::new(IpAddr::V6(ip), DEFAULT_PORT)));
            }
        }

        Err(LocusError::invalid_argument(format!(
            "invalid address: {s:?}"
        )))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_v4() {
        let addr: Address = "10.0.0.1:8000".parse().unwrap();
        assert_eq!(addr.port(), 8000);
        assert_eq!(addr.to_string(), "10.0.0.1:8000");

        let addr: Address = "10.0.0.1".parse().unwrap();
        assert_eq!(addr.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_parse_v6() {
        let addr: Address = "[::1]:9000".parse().unwrap();
        assert_eq!(addr.port(), 9000);

        let addr: Address = "[::1]".parse().unwrap();
        assert_eq!(addr.port(), DEFAULT_PORT);

        let addr: Address = "::1".parse().unwrap();
        assert_eq!(addr.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Address>().is_err());
        assert!("not-an-address".parse::<Address>().is_err());
        assert!("10.0.0.1:notaport".parse::<Address>().is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for s in ["127.0.0.1:7777", "[::1]:7777"] {
            let addr: Address = s.parse().unwrap();
            assert_eq!(addr.to_string(), s);
            let again: Address = addr.to_string().parse().unwrap();
            assert_eq!(addr, again);
        }
    }
}
