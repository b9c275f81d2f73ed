//! Switch: owns the listener, the peer table and every session task.

use crate::{
    addrbook::AddressBook,
    address::{short_id, NodeAddress},
    config::{ConfigError, P2pConfig},
    identity::NodeKey,
    peer::{PeerInfo, PeerTable, PeerTableError, Reservation, SessionHandle},
    pex::{PexAction, PexConfig, PexError, PexReactor},
    transport::{Connection, NodeInfo, Transport, TransportError, PEX_CHANNEL},
};
use reth_network_peers::PeerId;
use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    time::{sleep, sleep_until, timeout, Instant},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

/// Fatal start-up errors
#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why an outbound dial did not produce a session
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("switch is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Rejected(#[from] PeerTableError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Why a session ended
#[derive(Debug, thiserror::Error)]
enum SessionEnd {
    #[error("stopped")]
    Stopped,
    #[error("closed by remote")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Pex(#[from] PexError),
    #[error("unknown channel {0:#04x}")]
    UnknownChannel(u8),
    #[error("seed dwell elapsed")]
    DwellElapsed,
    #[error("peer stopped reading")]
    SendTimeout,
}

#[derive(Debug)]
struct SwitchInner {
    config: P2pConfig,
    transport: Transport,
    book: Arc<AddressBook>,
    reactor: Arc<PexReactor>,
    peers: PeerTable,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Handle to a running switch
#[derive(Debug, Clone)]
pub struct Switch {
    inner: Arc<SwitchInner>,
}

impl Switch {
    /// Bind the listener and start the accept, dial and save loops.
    ///
    /// Fails on invalid configuration or when the listen address cannot be bound.
    pub async fn start(
        config: P2pConfig,
        node_key: NodeKey,
        book: Arc<AddressBook>,
    ) -> Result<Self, SwitchError> {
        let seeds = config.validate()?;
        book.add_our_id(node_key.id());

        let listener = Transport::listen(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let node_info = NodeInfo::new(
            node_key.id(),
            local_addr,
            &config.chain_id,
            &config.moniker,
        );
        let transport = Transport::new(
            node_key,
            node_info,
            config.dial_timeout,
            config.handshake_timeout,
        );
        let reactor = Arc::new(PexReactor::new(
            PexConfig::from(&config),
            Arc::clone(&book),
        ));

        let switch = Self {
            inner: Arc::new(SwitchInner {
                peers: PeerTable::new(config.max_inbound, config.max_outbound),
                config,
                transport,
                book,
                reactor,
                local_addr,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        };

        info!(
            node_id = %switch.local_id(),
            listen_addr = %local_addr,
            chain_id = %switch.inner.config.chain_id,
            "Switch started"
        );

        let inner = &switch.inner;
        inner.tracker.spawn(switch.clone().run_accept_loop(listener));
        inner.tracker.spawn(Arc::clone(&inner.reactor).run_dial_loop(
            switch.clone(),
            seeds,
            inner.cancel.child_token(),
        ));
        inner.tracker.spawn(
            Arc::clone(&inner.book)
                .run_save_loop(inner.config.save_interval, inner.cancel.child_token()),
        );

        Ok(switch)
    }

    /// Get local peer ID
    pub fn local_id(&self) -> PeerId {
        self.inner.transport.local_id()
    }

    /// Bound listen address
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Our node info
    pub fn node_info(&self) -> &NodeInfo {
        self.inner.transport.node_info()
    }

    pub fn config(&self) -> &P2pConfig {
        &self.inner.config
    }

    pub fn book(&self) -> &Arc<AddressBook> {
        &self.inner.book
    }

    pub fn reactor(&self) -> &Arc<PexReactor> {
        &self.inner.reactor
    }

    /// Get peer count
    pub fn peer_count(&self) -> usize {
        self.inner.peers.peer_count()
    }

    pub fn num_inbound(&self) -> usize {
        self.inner.peers.num_inbound()
    }

    pub fn num_outbound(&self) -> usize {
        self.inner.peers.num_outbound()
    }

    /// Outbound slots in use, including dials in progress
    pub fn outbound_slots(&self) -> usize {
        self.inner.peers.outbound_slots()
    }

    pub fn max_outbound(&self) -> usize {
        self.inner.peers.max_outbound()
    }

    /// Snapshot of live peers
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner.peers.peers()
    }

    pub fn has_peer(&self, id: &PeerId) -> bool {
        self.inner.peers.contains(id)
    }

    /// Connected ids plus ids being dialed
    pub fn busy_ids(&self) -> HashSet<PeerId> {
        self.inner.peers.busy_ids()
    }

    /// Whether `stop` has been called
    pub fn is_stopping(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Signal the session of `id` to close
    pub fn stop_peer(&self, id: &PeerId) -> bool {
        self.inner.peers.stop(id)
    }

    /// Dial `addr` and start a session on success.
    ///
    /// The outbound slot is reserved before the socket is opened.
    pub async fn dial_peer(&self, addr: NodeAddress) -> Result<(), DialError> {
        if self.is_stopping() {
            return Err(DialError::ShuttingDown);
        }
        let reservation = self.inner.peers.reserve_outbound(addr.id)?;
        let conn = self.inner.transport.dial(&addr).await?;
        let info = PeerInfo::from_connection(&conn);
        let handle = self
            .inner
            .peers
            .register(reservation, info.clone(), &self.inner.cancel)?;

        info!(peer_id = %short_id(&info.id), %addr, "Connected to peer");
        self.inner.tracker.spawn(self.clone().run_session(conn, info, handle));
        Ok(())
    }

    /// Stop accepting work, close every session and wait until all tasks are done.
    pub async fn stop(&self) {
        info!(peers = self.peer_count(), "Stopping switch");
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Switch stopped");
    }

    async fn run_accept_loop(self, listener: TcpListener) {
        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                res = listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(err = %e, "Failed to accept connection");
                        sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            // the slot is taken before anything is spawned for this socket
            let reservation = match self.inner.peers.reserve_inbound() {
                Ok(reservation) => reservation,
                Err(e) => {
                    debug!(%remote_addr, err = %e, "Rejecting inbound connection");
                    drop(stream);
                    continue;
                }
            };

            trace!(%remote_addr, "Incoming connection");
            let switch = self.clone();
            self.inner
                .tracker
                .spawn(switch.handle_inbound(stream, remote_addr, reservation));
        }
        debug!("Accept loop stopped");
    }

    async fn handle_inbound(
        self,
        stream: TcpStream,
        remote_addr: SocketAddr,
        reservation: Reservation,
    ) {
        let conn = tokio::select! {
            _ = self.inner.cancel.cancelled() => return,
            res = self.inner.transport.accept(stream, remote_addr) => match res {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(%remote_addr, err = %e, "Inbound handshake failed");
                    return;
                }
            },
        };

        let info = PeerInfo::from_connection(&conn);
        let registered = self
            .inner
            .peers
            .register(reservation, info.clone(), &self.inner.cancel);
        match registered {
            Ok(handle) => {
                info!(peer_id = %short_id(&info.id), %remote_addr, "Accepted peer");
                self.run_session(conn, info, handle).await;
            }
            Err(e) => debug!(%remote_addr, err = %e, "Dropping duplicate inbound session"),
        }
    }

    async fn run_session(self, mut conn: Connection, info: PeerInfo, handle: SessionHandle) {
        let SessionHandle {
            session_id,
            cancel,
            queue_tx,
            mut queue_rx,
        } = handle;
        let peer_id = info.id;
        let send_timeout = self.inner.config.send_timeout;
        let reactor = Arc::clone(&self.inner.reactor);
        let mut pex = reactor.add_peer(&info, Instant::now().into_std());

        let end = loop {
            let deadline = Instant::from_std(reactor.next_deadline(&pex));
            tokio::select! {
                _ = cancel.cancelled() => break SessionEnd::Stopped,
                frame = conn.recv() => {
                    let (channel, payload) = match frame {
                        None => break SessionEnd::Closed,
                        Some(Err(e)) => break SessionEnd::Transport(e),
                        Some(Ok(frame)) => frame,
                    };
                    if channel != PEX_CHANNEL {
                        break SessionEnd::UnknownChannel(channel);
                    }
                    let now = Instant::now().into_std();
                    match reactor.handle_message(&mut pex, &payload, now) {
                        Ok(Some(reply)) => {
                            if queue_tx.try_send((PEX_CHANNEL, reply.to_bytes())).is_err() {
                                debug!(
                                    peer_id = %short_id(&peer_id),
                                    "Send queue full, dropping reply"
                                );
                            }
                        }
                        Ok(None) => {}
                        Err(e) => break SessionEnd::Pex(e),
                    }
                }
                Some((channel, payload)) = queue_rx.recv() => {
                    if let Err(end) =
                        send_frame(&mut conn, &cancel, send_timeout, channel, &payload).await
                    {
                        break end;
                    }
                }
                _ = sleep_until(deadline) => {
                    match reactor.poll(&mut pex, Instant::now().into_std()) {
                        PexAction::None => {}
                        PexAction::Send(msg) => {
                            let payload = msg.to_bytes();
                            if let Err(end) =
                                send_frame(&mut conn, &cancel, send_timeout, PEX_CHANNEL, &payload)
                                    .await
                            {
                                break end;
                            }
                        }
                        PexAction::DwellElapsed => break SessionEnd::DwellElapsed,
                    }
                }
            }
        };

        drop(conn);
        self.inner.peers.remove(&peer_id, session_id);
        let peer_id = short_id(&peer_id);
        match &end {
            SessionEnd::Pex(e) => warn!(%peer_id, err = %e, "Disconnecting misbehaving peer"),
            SessionEnd::Transport(e) => debug!(%peer_id, err = %e, "Peer connection failed"),
            _ => debug!(%peer_id, reason = %end, "Peer disconnected"),
        }
    }
}

/// Write one frame, giving up when the session is cancelled or the peer
/// does not drain its socket within `limit`.
async fn send_frame(
    conn: &mut Connection,
    cancel: &CancellationToken,
    limit: Duration,
    channel: u8,
    payload: &[u8],
) -> Result<(), SessionEnd> {
    tokio::select! {
        _ = cancel.cancelled() => Err(SessionEnd::Stopped),
        res = timeout(limit, conn.send(channel, payload)) => match res {
            Ok(sent) => sent.map_err(SessionEnd::from),
            Err(_) => Err(SessionEnd::SendTimeout),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_pair() -> (Connection, Connection) {
        let listener = Transport::listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let transport = |key: &NodeKey, listen: SocketAddr| {
            let info = NodeInfo::new(key.id(), listen, "chain", "test");
            Transport::new(
                key.clone(),
                info,
                Duration::from_secs(3),
                Duration::from_secs(5),
            )
        };

        let server_key = NodeKey::generate();
        let server = transport(&server_key, addr);
        let client = transport(&NodeKey::generate(), "127.0.0.1:26656".parse().unwrap());

        let accepted = tokio::spawn(async move {
            let (stream, remote_addr) = listener.accept().await.unwrap();
            server.accept(stream, remote_addr).await.unwrap()
        });
        let dialed = client
            .dial(&NodeAddress::new(server_key.id(), addr))
            .await
            .unwrap();
        (dialed, accepted.await.unwrap())
    }

    /// Write until a send fails; the remote never reads.
    async fn flood(
        conn: &mut Connection,
        cancel: &CancellationToken,
        limit: Duration,
    ) -> SessionEnd {
        let payload = vec![0xab; 64 * 1024];
        loop {
            if let Err(end) = send_frame(conn, cancel, limit, PEX_CHANNEL, &payload).await {
                return end;
            }
        }
    }

    #[tokio::test]
    async fn test_send_times_out_when_peer_stops_reading() {
        let (mut conn, _silent) = connected_pair().await;
        let cancel = CancellationToken::new();

        let end = timeout(
            Duration::from_secs(30),
            flood(&mut conn, &cancel, Duration::from_millis(300)),
        )
        .await
        .expect("send never blocked");
        assert!(matches!(end, SessionEnd::SendTimeout));
    }

    #[tokio::test]
    async fn test_blocked_send_yields_to_cancellation() {
        let (mut conn, _silent) = connected_pair().await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let end = timeout(
            Duration::from_secs(30),
            flood(&mut conn, &cancel, Duration::from_secs(600)),
        )
        .await
        .expect("cancellation did not interrupt the send");
        assert!(matches!(end, SessionEnd::Stopped));
    }
}
