//! Physical endpoints (IP:port) and their scope classification.
//!
//! The overlay never opens sockets itself; an [`Endpoint`] is just the
//! remote half of a path, handed to the host's `wire_packet_send` callback.
//! Scope classification drives SelfAwareness (reflexive addresses are
//! tracked per scope) and path-reset granularity.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::wire::WireError;

/// Address family selector used by ping scheduling and `path_lookup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

/// Coarse locality of an IP address.
///
/// Reflexive-address votes are bucketed by scope so that e.g. a NAT
/// rebinding on the WAN side does not disturb LAN paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpScope {
    /// 127.0.0.0/8, ::1
    Loopback,
    /// 169.254.0.0/16, fe80::/10
    LinkLocal,
    /// RFC 1918, fc00::/7
    Private,
    /// 100.64.0.0/10 carrier-grade NAT space
    Shared,
    /// Publicly routable
    Global,
}

/// A remote IP:port as seen by the host's sockets.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint(pub SocketAddr);

impl Endpoint {
    /// Wire tag bytes: 0x00 = nil, 0x04 = IPv4, 0x06 = IPv6.
    const TAG_NIL: u8 = 0x00;
    const TAG_V4: u8 = 0x04;
    const TAG_V6: u8 = 0x06;

    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(ip, port))
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn family(&self) -> AddressFamily {
        match self.0 {
            SocketAddr::V4(_) => AddressFamily::V4,
            SocketAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub fn scope(&self) -> IpScope {
        match self.0.ip() {
            IpAddr::V4(v4) => scope_v4(v4),
            IpAddr::V6(v6) => scope_v6(v6),
        }
    }

    /// Whether this endpoint may back an overlay path at all.
    ///
    /// Unspecified addresses and port zero can never carry traffic;
    /// loopback is allowed (local test rigs depend on it).
    pub fn is_valid_for_path(&self) -> bool {
        if self.0.port() == 0 {
            return false;
        }
        match self.0.ip() {
            IpAddr::V4(v4) => !v4.is_unspecified() && !v4.is_broadcast(),
            IpAddr::V6(v6) => !v6.is_unspecified(),
        }
    }

    /// Append the wire form: tag, address bytes, big-endian port.
    pub fn append_to(&self, buf: &mut Vec<u8>) {
        match self.0.ip() {
            IpAddr::V4(v4) => {
                buf.push(Self::TAG_V4);
                buf.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                buf.push(Self::TAG_V6);
                buf.extend_from_slice(&v6.octets());
            }
        }
        buf.extend_from_slice(&self.0.port().to_be_bytes());
    }

    /// Parse the wire form, returning the endpoint (None for the nil tag)
    /// and the number of bytes consumed.
    pub fn read_from(buf: &[u8]) -> Result<(Option<Self>, usize), WireError> {
        let tag = *buf.first().ok_or(WireError::BufferTooShort { need: 1, got: 0 })?;
        match tag {
            Self::TAG_NIL => Ok((None, 1)),
            Self::TAG_V4 => {
                if buf.len() < 7 {
                    return Err(WireError::BufferTooShort { need: 7, got: buf.len() });
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((Some(Self::new(IpAddr::V4(ip), port)), 7))
            }
            Self::TAG_V6 => {
                if buf.len() < 19 {
                    return Err(WireError::BufferTooShort { need: 19, got: buf.len() });
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((Some(Self::new(IpAddr::V6(Ipv6Addr::from(octets)), port)), 19))
            }
            other => Err(WireError::InvalidEndpointTag(other)),
        }
    }

    /// Append the nil tag (used where an endpoint slot is optional).
    pub fn append_nil(buf: &mut Vec<u8>) {
        buf.push(Self::TAG_NIL);
    }
}

fn scope_v4(ip: Ipv4Addr) -> IpScope {
    if ip.is_loopback() {
        IpScope::Loopback
    } else if ip.is_link_local() {
        IpScope::LinkLocal
    } else if ip.is_private() {
        IpScope::Private
    } else if ip.octets()[0] == 100 && (ip.octets()[1] & 0xc0) == 0x40 {
        IpScope::Shared
    } else {
        IpScope::Global
    }
}

fn scope_v6(ip: Ipv6Addr) -> IpScope {
    if ip.is_loopback() {
        IpScope::Loopback
    } else if (ip.segments()[0] & 0xffc0) == 0xfe80 {
        IpScope::LinkLocal
    } else if (ip.segments()[0] & 0xfe00) == 0xfc00 {
        IpScope::Private
    } else {
        IpScope::Global
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(sa: SocketAddr) -> Self {
        Self(sa)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self.0)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(s: &str) -> Endpoint {
        Endpoint(s.parse().unwrap())
    }

    #[test]
    fn test_scope_classification() {
        assert_eq!(ep("127.0.0.1:9993").scope(), IpScope::Loopback);
        assert_eq!(ep("10.1.2.3:9993").scope(), IpScope::Private);
        assert_eq!(ep("192.168.1.1:9993").scope(), IpScope::Private);
        assert_eq!(ep("169.254.10.10:9993").scope(), IpScope::LinkLocal);
        assert_eq!(ep("100.100.1.1:9993").scope(), IpScope::Shared);
        assert_eq!(ep("198.51.100.7:9993").scope(), IpScope::Global);
        assert_eq!(ep("[::1]:9993").scope(), IpScope::Loopback);
        assert_eq!(ep("[fe80::1]:9993").scope(), IpScope::LinkLocal);
        assert_eq!(ep("[fd00::1]:9993").scope(), IpScope::Private);
        assert_eq!(ep("[2001:db8::1]:9993").scope(), IpScope::Global);
    }

    #[test]
    fn test_path_validity() {
        assert!(ep("198.51.100.7:9993").is_valid_for_path());
        assert!(ep("127.0.0.1:9993").is_valid_for_path());
        assert!(!ep("198.51.100.7:0").is_valid_for_path());
        assert!(!ep("0.0.0.0:9993").is_valid_for_path());
        assert!(!ep("255.255.255.255:9993").is_valid_for_path());
    }

    #[test]
    fn test_wire_roundtrip() {
        for s in ["198.51.100.7:9993", "[2001:db8::1]:40000"] {
            let e = ep(s);
            let mut buf = Vec::new();
            e.append_to(&mut buf);
            let (parsed, used) = Endpoint::read_from(&buf).unwrap();
            assert_eq!(parsed, Some(e));
            assert_eq!(used, buf.len());
        }

        let mut buf = Vec::new();
        Endpoint::append_nil(&mut buf);
        let (parsed, used) = Endpoint::read_from(&buf).unwrap();
        assert_eq!(parsed, None);
        assert_eq!(used, 1);
    }

    #[test]
    fn test_bad_tag_rejected() {
        assert!(matches!(
            Endpoint::read_from(&[0x07, 1, 2]),
            Err(WireError::InvalidEndpointTag(0x07))
        ));
    }
}
