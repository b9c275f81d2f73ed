//! Peer table
//!
//! Tracks live sessions and enforces the inbound/outbound caps. A slot is
//! reserved before any per-connection resource exists and is handed over to
//! the session on registration, so the caps hold under connection floods.

use crate::{
    address::NodeAddress,
    transport::{Connection, Direction, NodeInfo},
};
use bytes::Bytes;
use parking_lot::Mutex;
use reth_network_peers::PeerId;
use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Depth of the per-peer outbound frame queue
pub const PEER_QUEUE_SIZE: usize = 16;

/// Why a slot or registration was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerTableError {
    #[error("inbound peer limit reached")]
    InboundFull,
    #[error("outbound peer limit reached")]
    OutboundFull,
    #[error("peer {0} already connected")]
    AlreadyConnected(PeerId),
    #[error("peer {0} is already being dialed")]
    AlreadyDialing(PeerId),
}

/// Information about a connected peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Peer ID (public key)
    pub id: PeerId,
    /// Socket address of the remote end
    pub remote_addr: SocketAddr,
    pub direction: Direction,
    /// Node info sent during the handshake
    pub node_info: NodeInfo,
    /// Connected at
    pub connected_at: Instant,
}

impl PeerInfo {
    /// Snapshot the info of a fresh connection
    pub fn from_connection(conn: &Connection) -> Self {
        Self {
            id: conn.id(),
            remote_addr: conn.remote_addr(),
            direction: conn.direction(),
            node_info: conn.node_info().clone(),
            connected_at: Instant::now(),
        }
    }

    /// Address other nodes can dial: observed ip plus advertised port for
    /// inbound peers, the dialed address for outbound ones.
    pub fn dialable_address(&self) -> Option<NodeAddress> {
        let addr = match self.direction {
            Direction::Outbound => self.remote_addr,
            Direction::Inbound => {
                let listen = self.node_info.listen_socket_addr().ok()?;
                SocketAddr::new(self.remote_addr.ip(), listen.port())
            }
        };
        Some(NodeAddress::new(self.id, addr))
    }

    pub fn is_inbound(&self) -> bool {
        self.direction.is_inbound()
    }
}

#[derive(Debug)]
struct PeerEntry {
    info: PeerInfo,
    session_id: u64,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct TableState {
    peers: HashMap<PeerId, PeerEntry>,
    dialing: HashSet<PeerId>,
    /// Reserved plus registered slots per direction
    inbound: usize,
    outbound: usize,
    next_session_id: u64,
}

impl TableState {
    fn release(&mut self, direction: Direction) {
        match direction {
            Direction::Inbound => self.inbound = self.inbound.saturating_sub(1),
            Direction::Outbound => self.outbound = self.outbound.saturating_sub(1),
        }
    }
}

/// A reserved connection slot. Dropping it without registering frees the slot.
#[derive(Debug)]
pub struct Reservation {
    state: Arc<Mutex<TableState>>,
    direction: Direction,
    dialing: Option<PeerId>,
    consumed: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(id) = self.dialing.take() {
            state.dialing.remove(&id);
        }
        if !self.consumed {
            state.release(self.direction);
        }
    }
}

/// Handles a session needs after registration
#[derive(Debug)]
pub struct SessionHandle {
    pub session_id: u64,
    pub cancel: CancellationToken,
    pub queue_tx: mpsc::Sender<(u8, Bytes)>,
    pub queue_rx: mpsc::Receiver<(u8, Bytes)>,
}

/// Live peers and connection slots
#[derive(Debug, Clone)]
pub struct PeerTable {
    state: Arc<Mutex<TableState>>,
    max_inbound: usize,
    max_outbound: usize,
}

impl PeerTable {
    /// Create new peer table
    pub fn new(max_inbound: usize, max_outbound: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(TableState::default())),
            max_inbound,
            max_outbound,
        }
    }

    /// Reserve an inbound slot for a just accepted socket
    pub fn reserve_inbound(&self) -> Result<Reservation, PeerTableError> {
        let mut state = self.state.lock();
        if state.inbound >= self.max_inbound {
            return Err(PeerTableError::InboundFull);
        }
        state.inbound += 1;
        Ok(Reservation {
            state: Arc::clone(&self.state),
            direction: Direction::Inbound,
            dialing: None,
            consumed: false,
        })
    }

    /// Reserve an outbound slot for dialing `id`
    pub fn reserve_outbound(&self, id: PeerId) -> Result<Reservation, PeerTableError> {
        let mut state = self.state.lock();
        if state.peers.contains_key(&id) {
            return Err(PeerTableError::AlreadyConnected(id));
        }
        if state.dialing.contains(&id) {
            return Err(PeerTableError::AlreadyDialing(id));
        }
        if state.outbound >= self.max_outbound {
            return Err(PeerTableError::OutboundFull);
        }
        state.outbound += 1;
        state.dialing.insert(id);
        Ok(Reservation {
            state: Arc::clone(&self.state),
            direction: Direction::Outbound,
            dialing: Some(id),
            consumed: false,
        })
    }

    /// Register a handshaken peer, consuming its reservation.
    ///
    /// Fails if a session for the same id already exists; the reservation is
    /// then dropped and its slot freed.
    pub fn register(
        &self,
        mut reservation: Reservation,
        info: PeerInfo,
        parent: &CancellationToken,
    ) -> Result<SessionHandle, PeerTableError> {
        let mut state = self.state.lock();
        if state.peers.contains_key(&info.id) {
            return Err(PeerTableError::AlreadyConnected(info.id));
        }

        state.next_session_id += 1;
        let session_id = state.next_session_id;
        let cancel = parent.child_token();
        let (queue_tx, queue_rx) = mpsc::channel(PEER_QUEUE_SIZE);
        state.peers.insert(
            info.id,
            PeerEntry {
                info,
                session_id,
                cancel: cancel.clone(),
            },
        );
        reservation.consumed = true;

        Ok(SessionHandle {
            session_id,
            cancel,
            queue_tx,
            queue_rx,
        })
    }

    /// Remove the session `session_id` of `id` and free its slot
    pub fn remove(&self, id: &PeerId, session_id: u64) -> Option<PeerInfo> {
        let mut state = self.state.lock();
        match state.peers.get(id) {
            Some(entry) if entry.session_id == session_id => {}
            _ => return None,
        }
        let entry = state.peers.remove(id)?;
        state.release(entry.info.direction);
        Some(entry.info)
    }

    /// Signal the session of `id` to close
    pub fn stop(&self, id: &PeerId) -> bool {
        match self.state.lock().peers.get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Get peer info
    pub fn get(&self, id: &PeerId) -> Option<PeerInfo> {
        self.state.lock().peers.get(id).map(|entry| entry.info.clone())
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.state.lock().peers.contains_key(id)
    }

    /// Snapshot of all live peers
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.state
            .lock()
            .peers
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Connected ids plus ids being dialed
    pub fn busy_ids(&self) -> HashSet<PeerId> {
        let state = self.state.lock();
        state.peers.keys().chain(state.dialing.iter()).copied().collect()
    }

    /// Get peer count
    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    /// Registered inbound sessions
    pub fn num_inbound(&self) -> usize {
        self.state
            .lock()
            .peers
            .values()
            .filter(|e| e.info.is_inbound())
            .count()
    }

    /// Registered outbound sessions
    pub fn num_outbound(&self) -> usize {
        self.state
            .lock()
            .peers
            .values()
            .filter(|e| !e.info.is_inbound())
            .count()
    }

    /// Outbound slots in use, counting dials in progress
    pub fn outbound_slots(&self) -> usize {
        self.state.lock().outbound
    }

    pub fn max_outbound(&self) -> usize {
        self.max_outbound
    }
}
