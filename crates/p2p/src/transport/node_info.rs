//! Node info exchanged during the handshake

use alloy_primitives::{keccak256, B256, B512};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use bytes::Bytes;
use reth_network_peers::PeerId;
use std::net::SocketAddr;

/// P2P protocol version spoken by this node
pub const P2P_PROTOCOL: u64 = 8;

/// Block protocol version advertised (seeds never relay blocks, but peers check it)
pub const BLOCK_PROTOCOL: u64 = 11;

/// Channel carrying peer exchange messages
pub const PEX_CHANNEL: u8 = 0x00;

/// Client version string
pub const CLIENT_VERSION: &str = concat!("seed-node/", env!("CARGO_PKG_VERSION"));

const MAX_CHANNELS: usize = 16;
const MAX_MONIKER_LEN: usize = 64;
const MAX_NETWORK_LEN: usize = 64;

/// Protocol versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct ProtocolVersion {
    pub p2p: u64,
    pub block: u64,
    pub app: u64,
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self {
            p2p: P2P_PROTOCOL,
            block: BLOCK_PROTOCOL,
            app: 0,
        }
    }
}

/// Description of a node, sent by both sides right after the encrypted handshake
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct NodeInfo {
    pub protocol_version: ProtocolVersion,
    pub id: PeerId,
    /// `ip:port` the node accepts connections on
    pub listen_addr: String,
    /// Chain id
    pub network: String,
    pub version: String,
    /// Channel ids the node speaks
    pub channels: Bytes,
    pub moniker: String,
}

/// Node info plus a signature over its hash by the node key
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct SignedNodeInfo {
    pub info: NodeInfo,
    pub signature: B512,
}

/// Why a remote node info was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeInfoError {
    #[error("invalid listen address {0:?}")]
    ListenAddr(String),
    #[error("invalid network {0:?}")]
    Network(String),
    #[error("invalid moniker")]
    Moniker,
    #[error("invalid channel list")]
    Channels,
    #[error("p2p protocol version mismatch: ours {ours}, theirs {theirs}")]
    P2pVersion { ours: u64, theirs: u64 },
    #[error("block protocol version mismatch: ours {ours}, theirs {theirs}")]
    BlockVersion { ours: u64, theirs: u64 },
    #[error("peer is on network {theirs:?}, we are on {ours:?}")]
    NetworkMismatch { ours: String, theirs: String },
    #[error("no common channels")]
    NoCommonChannels,
}

impl NodeInfo {
    /// Node info for a seed on `network`
    pub fn new(id: PeerId, listen_addr: SocketAddr, network: &str, moniker: &str) -> Self {
        Self {
            protocol_version: ProtocolVersion::default(),
            id,
            listen_addr: listen_addr.to_string(),
            network: network.to_string(),
            version: CLIENT_VERSION.to_string(),
            channels: Bytes::from_static(&[PEX_CHANNEL]),
            moniker: moniker.to_string(),
        }
    }

    /// Hash signed by the node key
    pub fn signing_hash(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }

    /// Parsed listen address
    pub fn listen_socket_addr(&self) -> Result<SocketAddr, NodeInfoError> {
        self.listen_addr
            .parse()
            .map_err(|_| NodeInfoError::ListenAddr(self.listen_addr.clone()))
    }

    /// Structural checks on a remote node info
    pub fn validate(&self) -> Result<(), NodeInfoError> {
        self.listen_socket_addr()?;

        if self.network.is_empty()
            || self.network.len() > MAX_NETWORK_LEN
            || !self.network.chars().all(|c| c.is_ascii_graphic())
        {
            return Err(NodeInfoError::Network(self.network.clone()));
        }

        if self.moniker.len() > MAX_MONIKER_LEN || self.moniker.chars().any(|c| c.is_control()) {
            return Err(NodeInfoError::Moniker);
        }

        if self.channels.len() > MAX_CHANNELS {
            return Err(NodeInfoError::Channels);
        }
        let mut seen = [false; 256];
        for &channel in self.channels.iter() {
            if std::mem::replace(&mut seen[channel as usize], true) {
                return Err(NodeInfoError::Channels);
            }
        }

        Ok(())
    }

    /// Whether two nodes can talk to each other
    pub fn compatible_with(&self, other: &NodeInfo) -> Result<(), NodeInfoError> {
        if self.protocol_version.p2p != other.protocol_version.p2p {
            return Err(NodeInfoError::P2pVersion {
                ours: self.protocol_version.p2p,
                theirs: other.protocol_version.p2p,
            });
        }
        if self.protocol_version.block != other.protocol_version.block {
            return Err(NodeInfoError::BlockVersion {
                ours: self.protocol_version.block,
                theirs: other.protocol_version.block,
            });
        }
        if self.network != other.network {
            return Err(NodeInfoError::NetworkMismatch {
                ours: self.network.clone(),
                theirs: other.network.clone(),
            });
        }
        if !self.channels.iter().any(|&c| other.has_channel(c)) {
            return Err(NodeInfoError::NoCommonChannels);
        }
        Ok(())
    }

    /// Whether the node speaks `channel`
    pub fn has_channel(&self, channel: u8) -> bool {
        self.channels.contains(&channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_rlp::Decodable;

    fn info(network: &str) -> NodeInfo {
        NodeInfo::new(
            B512::repeat_byte(1),
            "1.2.3.4:26656".parse().unwrap(),
            network,
            "test",
        )
    }

    #[test]
    fn test_rlp_roundtrip() {
        let signed = SignedNodeInfo {
            info: info("chain-a"),
            signature: B512::repeat_byte(9),
        };
        let encoded = alloy_rlp::encode(&signed);
        let decoded = SignedNodeInfo::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded, signed);
    }

    #[test]
    fn test_signing_hash_covers_fields() {
        let a = info("chain-a");
        let mut b = a.clone();
        b.moniker = "other".to_string();
        assert_ne!(a.signing_hash(), b.signing_hash());
        assert_eq!(a.signing_hash(), a.clone().signing_hash());
    }

    #[test]
    fn test_validate() {
        assert!(info("chain-a").validate().is_ok());

        let mut bad = info("chain-a");
        bad.listen_addr = "nowhere".to_string();
        assert!(matches!(bad.validate(), Err(NodeInfoError::ListenAddr(_))));

        let mut bad = info("chain-a");
        bad.network = "chain a".to_string();
        assert!(matches!(bad.validate(), Err(NodeInfoError::Network(_))));

        let mut bad = info("chain-a");
        bad.channels = Bytes::from_static(&[0, 0]);
        assert_eq!(bad.validate(), Err(NodeInfoError::Channels));

        let mut bad = info("chain-a");
        bad.moniker = "x".repeat(65);
        assert_eq!(bad.validate(), Err(NodeInfoError::Moniker));
    }

    #[test]
    fn test_compatibility() {
        let ours = info("chain-a");
        assert!(ours.compatible_with(&info("chain-a")).is_ok());

        assert!(matches!(
            ours.compatible_with(&info("chain-b")),
            Err(NodeInfoError::NetworkMismatch { .. })
        ));

        let mut old = info("chain-a");
        old.protocol_version.p2p = 7;
        assert!(matches!(
            ours.compatible_with(&old),
            Err(NodeInfoError::P2pVersion { .. })
        ));

        let mut other_block = info("chain-a");
        other_block.protocol_version.block = 10;
        assert!(matches!(
            ours.compatible_with(&other_block),
            Err(NodeInfoError::BlockVersion { .. })
        ));

        let mut no_pex = info("chain-a");
        no_pex.channels = Bytes::from_static(&[0x20, 0x21]);
        assert!(!no_pex.has_channel(PEX_CHANNEL));
        assert_eq!(
            ours.compatible_with(&no_pex),
            Err(NodeInfoError::NoCommonChannels)
        );
    }
}
