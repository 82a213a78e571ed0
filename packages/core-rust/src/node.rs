//! Node identity and the cluster node record.
//!
//! A node is identified by its primary listener address plus an optional
//! dedicated data-plane ("io") listener. Identity comparison is a
//! lexicographic compare over the identity fields, which gives every node
//! the same stable total order; master election picks the smallest live
//! node under this order.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default number of virtual placement points per node.
pub const DEFAULT_VNODES: u16 = 64;

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// Unique node identity: primary address/port plus an optional io pair.
///
/// The io pair, when present, names a second listener that data-plane
/// peers prefer for object traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub addr: IpAddr,
    pub port: u16,
    pub io_addr: Option<IpAddr>,
    pub io_port: u16,
}

impl NodeId {
    /// Identity from a primary listener address only.
    #[must_use]
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self {
            addr,
            port,
            io_addr: None,
            io_port: 0,
        }
    }

    /// Identity with a dedicated io listener.
    #[must_use]
    pub fn with_io(addr: IpAddr, port: u16, io_addr: IpAddr, io_port: u16) -> Self {
        Self {
            addr,
            port,
            io_addr: Some(io_addr),
            io_port,
        }
    }

    /// The primary listener address.
    #[must_use]
    pub fn primary(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// The io listener if configured, else the primary listener.
    #[must_use]
    pub fn io_target(&self) -> SocketAddr {
        match self.io_addr {
            Some(io) => SocketAddr::new(io, self.io_port),
            None => self.primary(),
        }
    }

    /// Stable identity bytes, used to derive hashes and event ids.
    #[must_use]
    pub fn identity_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(40);
        match self.addr {
            IpAddr::V4(v4) => out.extend_from_slice(&v4.to_ipv6_mapped().octets()),
            IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
        }
        out.extend_from_slice(&self.port.to_be_bytes());
        match self.io_addr {
            Some(IpAddr::V4(v4)) => out.extend_from_slice(&v4.to_ipv6_mapped().octets()),
            Some(IpAddr::V6(v6)) => out.extend_from_slice(&v6.octets()),
            None => out.extend_from_slice(&[0u8; 16]),
        }
        out.extend_from_slice(&self.io_port.to_be_bytes());
        out
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary())?;
        if let Some(io) = self.io_addr {
            write!(f, "/{}", SocketAddr::new(io, self.io_port))?;
        }
        Ok(())
    }
}

impl FromStr for NodeId {
    type Err = NodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (primary, io) = match s.split_once('/') {
            Some((p, i)) => (p, Some(i)),
            None => (s, None),
        };
        let primary: SocketAddr = primary
            .parse()
            .map_err(|_| NodeParseError(s.to_string()))?;
        let mut nid = Self::new(primary.ip(), primary.port());
        if let Some(io) = io {
            let io: SocketAddr = io.parse().map_err(|_| NodeParseError(s.to_string()))?;
            nid.io_addr = Some(io.ip());
            nid.io_port = io.port();
        }
        Ok(nid)
    }
}

/// Error parsing a node identity from its string form.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid node address: {0}")]
pub struct NodeParseError(String);

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A cluster member: identity plus placement weight and failure domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub nid: NodeId,
    /// Virtual placement points on the ring; scales with capacity.
    pub nr_vnodes: u16,
    /// Failure domain; replicas of one object land in distinct zones
    /// when enough zones exist.
    pub zone: u32,
    /// Advertised backing-store capacity in bytes.
    pub space: u64,
}

impl Node {
    /// A node with the default vnode weight and a zone derived from its
    /// primary address.
    #[must_use]
    pub fn new(nid: NodeId, zone: u32, space: u64) -> Self {
        Self {
            nid,
            nr_vnodes: DEFAULT_VNODES,
            zone,
            space,
        }
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.nid.cmp(&other.nid)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.nid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nid(last: u8, port: u16) -> NodeId {
        NodeId::new(IpAddr::from([10, 0, 0, last]), port)
    }

    #[test]
    fn display_and_parse_round_trip() {
        let n = nid(1, 7000);
        let parsed: NodeId = n.to_string().parse().unwrap();
        assert_eq!(n, parsed);

        let with_io = NodeId::with_io(
            IpAddr::from([10, 0, 0, 1]),
            7000,
            IpAddr::from([192, 168, 0, 1]),
            7001,
        );
        assert_eq!(with_io.to_string(), "10.0.0.1:7000/192.168.0.1:7001");
        let parsed: NodeId = with_io.to_string().parse().unwrap();
        assert_eq!(with_io, parsed);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("not-an-addr".parse::<NodeId>().is_err());
        assert!("10.0.0.1:7000/nope".parse::<NodeId>().is_err());
    }

    #[test]
    fn ordering_is_total_and_stable() {
        let a = nid(1, 7000);
        let b = nid(1, 7001);
        let c = nid(2, 7000);
        let mut v = vec![c, b, a];
        v.sort();
        assert_eq!(v, vec![a, b, c]);
    }

    #[test]
    fn io_target_prefers_io_pair() {
        let plain = nid(1, 7000);
        assert_eq!(plain.io_target(), plain.primary());

        let dual = NodeId::with_io(
            IpAddr::from([10, 0, 0, 1]),
            7000,
            IpAddr::from([192, 168, 0, 1]),
            7001,
        );
        assert_eq!(dual.io_target().port(), 7001);
    }

    #[test]
    fn identity_bytes_differ_per_identity() {
        assert_ne!(nid(1, 7000).identity_bytes(), nid(1, 7001).identity_bytes());
        assert_eq!(nid(1, 7000).identity_bytes(), nid(1, 7000).identity_bytes());
    }
}
