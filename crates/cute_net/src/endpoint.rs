//! Network endpoints as they appear inside a connect token and on the wire.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// An IPv4 or IPv6 address plus port, equal by tag + address + port.
///
/// A plain [`SocketAddr`] would do, but the wire format distinguishes the
/// two address families by an explicit tag byte rather than relying on
/// `std`'s internal representation, so tokens stay portable across
/// implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// IPv4 address and port.
    V4 {
        /// Address octets.
        octets: [u8; 4],
        /// Port number.
        port: u16,
    },
    /// IPv6 address and port.
    V6 {
        /// Address groups.
        groups: [u16; 8],
        /// Port number.
        port: u16,
    },
}

impl Endpoint {
    /// Encoded size of this particular endpoint: 7 bytes for IPv4, 19 for
    /// IPv6. Variable per-endpoint, unlike a fixed-stride slot, so that the
    /// connect token's public section can fit up to 32 endpoints inside its
    /// budget.
    #[must_use]
    pub const fn encoded_len(&self) -> usize {
        match self {
            Self::V4 { .. } => 1 + 4 + 2,
            Self::V6 { .. } => 1 + 16 + 2,
        }
    }

    /// Appends this endpoint's wire encoding to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            Self::V4 { octets, port } => {
                out.push(0);
                out.extend_from_slice(&octets);
                out.extend_from_slice(&port.to_le_bytes());
            }
            Self::V6 { groups, port } => {
                out.push(1);
                for group in groups {
                    out.extend_from_slice(&group.to_le_bytes());
                }
                out.extend_from_slice(&port.to_le_bytes());
            }
        }
    }

    /// Reads one endpoint from the front of `buf`, returning it along with
    /// the number of bytes consumed.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        match buf.first()? {
            0 => {
                if buf.len() < 7 {
                    return None;
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&buf[1..5]);
                let port = u16::from_le_bytes([buf[5], buf[6]]);
                Some((Self::V4 { octets, port }, 7))
            }
            1 => {
                if buf.len() < 19 {
                    return None;
                }
                let mut groups = [0u16; 8];
                for (i, group) in groups.iter_mut().enumerate() {
                    *group = u16::from_le_bytes([buf[1 + i * 2], buf[2 + i * 2]]);
                }
                let port = u16::from_le_bytes([buf[17], buf[18]]);
                Some((Self::V6 { groups, port }, 19))
            }
            _ => None,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::V4 {
                octets: v4.ip().octets(),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => Self::V6 {
                groups: v6.ip().segments(),
                port: v6.port(),
            },
        }
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        match endpoint {
            Endpoint::V4 { octets, port } => {
                Self::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port))
            }
            Endpoint::V6 { groups, port } => {
                Self::V6(SocketAddrV6::new(Ipv6Addr::from(groups), port, 0, 0))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_round_trips() {
        let e = Endpoint::V4 {
            octets: [127, 0, 0, 1],
            port: 5000,
        };
        let mut buf = Vec::new();
        e.encode(&mut buf);
        assert_eq!(7, buf.len());
        assert_eq!(Some((e, 7)), Endpoint::decode(&buf));
    }

    #[test]
    fn v6_round_trips() {
        let e = Endpoint::V6 {
            groups: [0, 0, 0, 0, 0, 0, 0, 1],
            port: 5000,
        };
        let mut buf = Vec::new();
        e.encode(&mut buf);
        assert_eq!(19, buf.len());
        assert_eq!(Some((e, 19)), Endpoint::decode(&buf));
    }

    #[test]
    fn socket_addr_conversion_round_trips() {
        let addr: SocketAddr = "[::1]:5000".parse().unwrap();
        let endpoint = Endpoint::from(addr);
        assert_eq!(addr, SocketAddr::from(endpoint));
    }
}
