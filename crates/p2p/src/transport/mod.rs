//! Encrypted, authenticated peer connections.
//!
//! Every connection runs the ECIES handshake (which proves the remote owns the
//! key behind its id) followed by a signed node info exchange that negotiates
//! network, protocol versions and channels. Afterwards each frame carries one
//! channel byte followed by the channel payload.

mod node_info;

pub use node_info::{
    NodeInfo, NodeInfoError, ProtocolVersion, SignedNodeInfo, BLOCK_PROTOCOL, CLIENT_VERSION,
    P2P_PROTOCOL, PEX_CHANNEL,
};

use crate::{
    address::NodeAddress,
    identity::{self, NodeKey},
};
use alloy_rlp::Decodable;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use reth_ecies::stream::ECIESStream;
use reth_network_peers::PeerId;
use std::{io, net::SocketAddr, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tracing::{debug, trace};

/// Connection direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The remote dialed us
    Inbound,
    /// We dialed the remote
    Outbound,
}

impl Direction {
    pub fn is_inbound(&self) -> bool {
        matches!(self, Self::Inbound)
    }

    pub fn is_outbound(&self) -> bool {
        matches!(self, Self::Outbound)
    }
}

/// Transport errors. Only `Listen` is fatal; everything else ends one connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("dial to {0} timed out")]
    DialTimeout(SocketAddr),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("encrypted handshake failed: {0}")]
    Ecies(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("connection closed during handshake")]
    ClosedDuringHandshake,
    #[error("malformed node info: {0}")]
    MalformedNodeInfo(String),
    #[error("invalid node info: {0}")]
    InvalidNodeInfo(#[from] NodeInfoError),
    #[error("invalid node info signature")]
    InvalidSignature,
    #[error("node info claims id {claimed}, authenticated as {authenticated}")]
    IdMismatch { claimed: PeerId, authenticated: PeerId },
    #[error("connected to self")]
    SelfConnection,
    #[error("stream error: {0}")]
    Stream(String),
    #[error("empty frame")]
    EmptyFrame,
}

/// Accepts and dials peer connections on behalf of the local node
#[derive(Debug, Clone)]
pub struct Transport {
    node_key: NodeKey,
    node_info: NodeInfo,
    dial_timeout: Duration,
    handshake_timeout: Duration,
}

impl Transport {
    /// Create new transport
    pub fn new(
        node_key: NodeKey,
        node_info: NodeInfo,
        dial_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            node_key,
            node_info,
            dial_timeout,
            handshake_timeout,
        }
    }

    /// Bind a listener. Failure here is fatal for the node.
    pub async fn listen(addr: SocketAddr) -> Result<TcpListener, TransportError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Listen { addr, source })
    }

    /// Our node info
    pub fn node_info(&self) -> &NodeInfo {
        &self.node_info
    }

    /// Our node id
    pub fn local_id(&self) -> PeerId {
        self.node_key.id()
    }

    /// Dial `addr` and run the full handshake.
    pub async fn dial(&self, addr: &NodeAddress) -> Result<Connection, TransportError> {
        if addr.id == self.local_id() {
            return Err(TransportError::SelfConnection);
        }

        debug!(%addr, "Dialing peer");
        let tcp = timeout(self.dial_timeout, TcpStream::connect(addr.addr))
            .await
            .map_err(|_| TransportError::DialTimeout(addr.addr))??;

        timeout(self.handshake_timeout, async {
            trace!(%addr, "Starting ECIES handshake");
            let stream = ECIESStream::connect(tcp, self.node_key.secret_key(), addr.id)
                .await
                .map_err(|e| TransportError::Ecies(e.to_string()))?;
            let remote_id = stream.remote_id();
            self.exchange_node_info(stream, remote_id, addr.addr, Direction::Outbound)
                .await
        })
        .await
        .map_err(|_| TransportError::HandshakeTimeout)?
    }

    /// Run the full handshake on an accepted socket.
    pub async fn accept(
        &self,
        tcp: TcpStream,
        remote_addr: SocketAddr,
    ) -> Result<Connection, TransportError> {
        timeout(self.handshake_timeout, async {
            trace!(%remote_addr, "Starting ECIES handshake (inbound)");
            let stream = ECIESStream::incoming(tcp, self.node_key.secret_key())
                .await
                .map_err(|e| TransportError::Ecies(e.to_string()))?;
            let remote_id = stream.remote_id();
            self.exchange_node_info(stream, remote_id, remote_addr, Direction::Inbound)
                .await
        })
        .await
        .map_err(|_| TransportError::HandshakeTimeout)?
    }

    async fn exchange_node_info(
        &self,
        mut stream: ECIESStream<TcpStream>,
        authenticated: PeerId,
        remote_addr: SocketAddr,
        direction: Direction,
    ) -> Result<Connection, TransportError> {
        if authenticated == self.local_id() {
            return Err(TransportError::SelfConnection);
        }

        let ours = SignedNodeInfo {
            signature: self.node_key.sign(self.node_info.signing_hash()),
            info: self.node_info.clone(),
        };
        stream
            .send(Bytes::from(alloy_rlp::encode(&ours)))
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;

        let frame = stream
            .next()
            .await
            .ok_or(TransportError::ClosedDuringHandshake)?
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        let theirs = SignedNodeInfo::decode(&mut frame.as_ref())
            .map_err(|e| TransportError::MalformedNodeInfo(e.to_string()))?;

        if theirs.info.id != authenticated {
            return Err(TransportError::IdMismatch {
                claimed: theirs.info.id,
                authenticated,
            });
        }
        if !identity::verify(&authenticated, theirs.info.signing_hash(), &theirs.signature) {
            return Err(TransportError::InvalidSignature);
        }
        theirs.info.validate()?;
        self.node_info.compatible_with(&theirs.info)?;

        debug!(
            peer_id = %authenticated,
            %remote_addr,
            ?direction,
            moniker = %theirs.info.moniker,
            version = %theirs.info.version,
            "Handshake completed"
        );

        Ok(Connection {
            stream,
            info: theirs.info,
            remote_addr,
            direction,
        })
    }
}

/// An authenticated, negotiated connection to a peer
pub struct Connection {
    stream: ECIESStream<TcpStream>,
    info: NodeInfo,
    remote_addr: SocketAddr,
    direction: Direction,
}

impl Connection {
    /// Authenticated remote id
    pub fn id(&self) -> PeerId {
        self.info.id
    }

    /// Remote node info
    pub fn node_info(&self) -> &NodeInfo {
        &self.info
    }

    /// Socket address of the remote end
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Send one payload on `channel`
    pub async fn send(&mut self, channel: u8, payload: &[u8]) -> Result<(), TransportError> {
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(channel);
        frame.extend_from_slice(payload);
        self.stream
            .send(Bytes::from(frame))
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))
    }

    /// Next `(channel, payload)` frame, `None` once the remote closed.
    pub async fn recv(&mut self) -> Option<Result<(u8, Bytes), TransportError>> {
        let frame = match self.stream.next().await? {
            Ok(frame) => frame,
            Err(e) => return Some(Err(TransportError::Stream(e.to_string()))),
        };
        if frame.is_empty() {
            return Some(Err(TransportError::EmptyFrame));
        }
        let mut frame = frame;
        let payload = frame.split_off(1).freeze();
        Some(Ok((frame[0], payload)))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.info.id)
            .field("remote_addr", &self.remote_addr)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}
