//! Dialable peer addresses

use reth_network_peers::PeerId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt,
    hash::{Hash, Hasher},
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

/// Address parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("missing '@' between node id and host")]
    MissingId,
    #[error("invalid node id: {0}")]
    InvalidId(String),
    #[error("invalid socket address {0:?}")]
    InvalidSocketAddr(String),
}

/// Parse a hex encoded node id, with or without `0x` prefix.
pub fn parse_peer_id(s: &str) -> Result<PeerId, AddressError> {
    let s = s.trim();
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).map_err(|e| AddressError::InvalidId(e.to_string()))?;
    if bytes.len() != PeerId::len_bytes() {
        return Err(AddressError::InvalidId(format!(
            "expected 64 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(PeerId::from_slice(&bytes))
}

/// Short, log friendly form of a node id
pub fn short_id(id: &PeerId) -> String {
    hex::encode(&id[..8])
}

/// The unique, dialable reference to a peer.
///
/// Two addresses are equal when their node ids are equal; the socket address is
/// the last one observed for that id.
#[derive(Debug, Clone, Copy)]
pub struct NodeAddress {
    pub id: PeerId,
    pub addr: SocketAddr,
}

impl NodeAddress {
    /// Create new node address
    pub fn new(id: PeerId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    /// Port is set and the IP is a specified unicast address.
    pub fn is_valid(&self) -> bool {
        if self.addr.port() == 0 {
            return false;
        }
        match self.addr.ip() {
            IpAddr::V4(ip) => !(ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast()),
            IpAddr::V6(ip) => !(ip.is_unspecified() || ip.is_multicast()),
        }
    }

    /// Valid and reachable from the public internet.
    pub fn is_routable(&self) -> bool {
        if !self.is_valid() {
            return false;
        }
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                // 100.64.0.0/10 carrier grade NAT
                let shared = ip.octets()[0] == 100 && (ip.octets()[1] & 0xc0) == 64;
                !(ip.is_private()
                    || ip.is_loopback()
                    || ip.is_link_local()
                    || ip.is_documentation()
                    || shared)
            }
            IpAddr::V6(ip) => {
                let segments = ip.segments();
                // fc00::/7 unique local
                let unique_local = (segments[0] & 0xfe00) == 0xfc00;
                // fe80::/10 link local
                let link_local = (segments[0] & 0xffc0) == 0xfe80;
                // 2001:db8::/32 documentation
                let documentation = segments[0] == 0x2001 && segments[1] == 0x0db8;
                !(ip.is_loopback() || unique_local || link_local || documentation)
            }
        }
    }
}

impl PartialEq for NodeAddress {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeAddress {}

impl Hash for NodeAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", hex::encode(self.id), self.addr)
    }
}

impl FromStr for NodeAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addr) = s.trim().split_once('@').ok_or(AddressError::MissingId)?;
        let id = parse_peer_id(id)?;
        let addr = addr
            .parse()
            .map_err(|_| AddressError::InvalidSocketAddr(addr.to_string()))?;
        Ok(Self { id, addr })
    }
}

impl Serialize for NodeAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
