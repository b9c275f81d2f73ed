//! PEX wire messages
//!
//! Every message is one type byte followed by an optional RLP body:
//! `0x01` for a request (no body) and `0x02` followed by a list of addresses.

use super::PexError;
use crate::address::NodeAddress;
use alloy_primitives::B512;
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Message id of an address request
pub const PEX_REQUEST: u8 = 0x01;
/// Message id of an address response
pub const PEX_ADDRS: u8 = 0x02;

/// Address as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct WireAddress {
    pub id: B512,
    /// 4 or 16 address bytes
    pub ip: Bytes,
    pub port: u16,
}

impl From<&NodeAddress> for WireAddress {
    fn from(addr: &NodeAddress) -> Self {
        let ip = match addr.addr.ip() {
            IpAddr::V4(ip) => Bytes::copy_from_slice(&ip.octets()),
            IpAddr::V6(ip) => Bytes::copy_from_slice(&ip.octets()),
        };
        Self {
            id: addr.id,
            ip,
            port: addr.addr.port(),
        }
    }
}

impl WireAddress {
    /// Convert into a node address, `None` if the ip bytes are malformed
    pub fn to_node_address(&self) -> Option<NodeAddress> {
        let ip = match self.ip.len() {
            4 => {
                let octets: [u8; 4] = self.ip.as_ref().try_into().ok()?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            16 => {
                let octets: [u8; 16] = self.ip.as_ref().try_into().ok()?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return None,
        };
        Some(NodeAddress::new(self.id, SocketAddr::new(ip, self.port)))
    }
}

/// A PEX message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PexMessage {
    /// Ask the peer for addresses
    Request,
    /// Addresses sent in response to a request
    Addrs(Vec<WireAddress>),
}

impl PexMessage {
    /// Response carrying `addrs`
    pub fn addrs<'a>(addrs: impl IntoIterator<Item = &'a NodeAddress>) -> Self {
        Self::Addrs(addrs.into_iter().map(WireAddress::from).collect())
    }

    /// Encode into a channel payload
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Request => Bytes::from_static(&[PEX_REQUEST]),
            Self::Addrs(addrs) => {
                let mut buf = BytesMut::new();
                buf.put_u8(PEX_ADDRS);
                addrs.encode(&mut buf);
                buf.freeze()
            }
        }
    }

    /// Decode a channel payload
    pub fn from_bytes(payload: &[u8]) -> Result<Self, PexError> {
        let (&id, mut body) = payload
            .split_first()
            .ok_or_else(|| PexError::Malformed("empty message".into()))?;
        match id {
            PEX_REQUEST if body.is_empty() => Ok(Self::Request),
            PEX_REQUEST => Err(PexError::Malformed("request with a body".into())),
            PEX_ADDRS => {
                let addrs = Vec::<WireAddress>::decode(&mut body)
                    .map_err(|e| PexError::Malformed(e.to_string()))?;
                if !body.is_empty() {
                    return Err(PexError::Malformed("trailing bytes".into()));
                }
                Ok(Self::Addrs(addrs))
            }
            other => Err(PexError::Malformed(format!("unknown message id {other:#04x}"))),
        }
    }
}
