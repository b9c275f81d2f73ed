//! PEX reactor
//!
//! Per-peer protocol state is a plain value owned by the session task; the
//! reactor itself only holds shared, process-scoped state (the address book
//! and the dial backoff). `handle_message` and `poll` are synchronous so the
//! state machine can be driven by any clock.

use super::{PexError, PexMessage};
use crate::{
    addrbook::AddressBook,
    address::{short_id, NodeAddress},
    backoff::{DialBackoff, MAX_DIAL_ATTEMPTS},
    config::{P2pConfig, SeedAddress},
    peer::PeerInfo,
    switch::{DialError, Switch},
    transport::Direction,
};
use rand::{seq::SliceRandom, Rng};
use reth_network_peers::PeerId;
use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// How long a peer that abused the protocol stays out of the book
pub const DEFAULT_BAN_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound on the delay before the first request to a new peer
const MAX_FIRST_REQUEST_DELAY: Duration = Duration::from_secs(3);

/// Reactor tunables
#[derive(Debug, Clone)]
pub struct PexConfig {
    pub seed_mode: bool,
    /// Base interval between requests to the same peer, and of the dial loop
    pub ensure_peers_period: Duration,
    /// Upper bound of the random delay before the first request
    pub first_request_delay: Duration,
    /// Requests arriving faster than this are abuse
    pub min_receive_interval: Duration,
    /// Inbound peers are dropped this long after their last address exchange
    pub seed_dwell: Duration,
    /// Maximum age of any session in seed mode
    pub seed_disconnect_wait: Duration,
    /// Hard cap on addresses in one response
    pub max_pex_addresses: usize,
    pub ban_duration: Duration,
}

impl From<&P2pConfig> for PexConfig {
    fn from(config: &P2pConfig) -> Self {
        Self {
            seed_mode: config.seed_mode,
            ensure_peers_period: config.ensure_peers_period,
            first_request_delay: config.ensure_peers_period.min(MAX_FIRST_REQUEST_DELAY),
            min_receive_interval: config.ensure_peers_period / 3,
            seed_dwell: config.seed_dwell,
            seed_disconnect_wait: config.seed_disconnect_wait,
            max_pex_addresses: config.max_pex_addresses,
            ban_duration: DEFAULT_BAN_DURATION,
        }
    }
}

/// Requester side of the per-peer state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting until `next_request`
    Idle { next_request: Instant },
    /// Request sent at `sent_at`, waiting for the response
    RequestSent { sent_at: Instant },
}

/// What the session should do after a timer fired
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PexAction {
    None,
    Send(PexMessage),
    /// Seed-mode dwell elapsed; close the session
    DwellElapsed,
}

/// PEX state of one session
#[derive(Debug, Clone)]
pub struct PexPeer {
    pub id: PeerId,
    pub direction: Direction,
    pub requester: RequestState,
    /// When the peer last asked us for addresses
    pub last_request_received: Option<Instant>,
    /// Seed-mode disconnect deadline, armed by the first address exchange
    pub dwell_deadline: Option<Instant>,
}

/// Peer exchange protocol logic shared by all sessions
#[derive(Debug)]
pub struct PexReactor {
    config: PexConfig,
    book: Arc<AddressBook>,
    backoff: DialBackoff,
}

impl PexReactor {
    /// Create new reactor
    pub fn new(config: PexConfig, book: Arc<AddressBook>) -> Self {
        Self {
            config,
            book,
            backoff: DialBackoff::default(),
        }
    }

    /// Reactor configuration
    pub fn config(&self) -> &PexConfig {
        &self.config
    }

    /// The address book fed by this reactor
    pub fn book(&self) -> &Arc<AddressBook> {
        &self.book
    }

    /// Dial backoff state
    pub fn backoff(&self) -> &DialBackoff {
        &self.backoff
    }

    /// A session finished its handshake.
    ///
    /// Records the peer's dialable address, marks outbound peers good and
    /// schedules the first request.
    pub fn add_peer(&self, info: &PeerInfo, now: Instant) -> PexPeer {
        if let Some(addr) = info.dialable_address() {
            if let Err(e) = self.book.add_address(addr, info.id) {
                debug!(peer_id = %short_id(&info.id), err = %e, "Not adding peer address");
            }
        }
        if info.direction.is_outbound() {
            self.book.mark_good(&info.id);
            self.backoff.reset(&info.id);
        }

        let delay = if self.book.need_more_addresses() {
            rand::thread_rng().gen_range(Duration::ZERO..=self.config.first_request_delay)
        } else {
            self.request_interval()
        };

        PexPeer {
            id: info.id,
            direction: info.direction,
            requester: RequestState::Idle {
                next_request: now + delay,
            },
            last_request_received: None,
            dwell_deadline: None,
        }
    }

    /// Handle one message from `peer`. Returns the reply to queue, if any.
    ///
    /// Any error means the session must be closed.
    pub fn handle_message(
        &self,
        peer: &mut PexPeer,
        payload: &[u8],
        now: Instant,
    ) -> Result<Option<PexMessage>, PexError> {
        match PexMessage::from_bytes(payload)? {
            PexMessage::Request => self.handle_request(peer, now).map(Some),
            PexMessage::Addrs(addrs) => {
                self.handle_addrs(peer, addrs, now)?;
                Ok(None)
            }
        }
    }

    fn handle_request(&self, peer: &mut PexPeer, now: Instant) -> Result<PexMessage, PexError> {
        if let Some(last) = peer.last_request_received {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.config.min_receive_interval {
                return Err(PexError::RequestTooFrequent { elapsed });
            }
        }
        peer.last_request_received = Some(now);

        let exclude = HashSet::from([peer.id]);
        let selection = self.book.get_selection(&exclude, self.config.max_pex_addresses);
        trace!(
            peer_id = %short_id(&peer.id),
            addrs = selection.len(),
            "Answering address request"
        );

        self.arm_dwell(peer, now);
        Ok(PexMessage::addrs(&selection))
    }

    fn handle_addrs(
        &self,
        peer: &mut PexPeer,
        addrs: Vec<super::WireAddress>,
        now: Instant,
    ) -> Result<(), PexError> {
        if addrs.len() > self.config.max_pex_addresses {
            self.book.mark_bad(&peer.id, self.config.ban_duration);
            return Err(PexError::TooManyAddresses {
                got: addrs.len(),
                max: self.config.max_pex_addresses,
            });
        }
        if !matches!(peer.requester, RequestState::RequestSent { .. }) {
            return Err(PexError::Unsolicited);
        }

        let mut added = 0;
        for wire in &addrs {
            let Some(addr) = wire.to_node_address() else {
                trace!(peer_id = %short_id(&peer.id), "Skipping malformed address");
                continue;
            };
            match self.book.add_address(addr, peer.id) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(e) => trace!(%addr, err = %e, "Skipping received address"),
            }
        }
        debug!(
            peer_id = %short_id(&peer.id),
            received = addrs.len(),
            added,
            book_size = self.book.size(),
            "Received addresses"
        );

        peer.requester = RequestState::Idle {
            next_request: now + self.request_interval(),
        };
        self.arm_dwell(peer, now);
        Ok(())
    }

    /// Advance timers. Call when `next_deadline` has passed.
    pub fn poll(&self, peer: &mut PexPeer, now: Instant) -> PexAction {
        if peer.dwell_deadline.is_some_and(|deadline| deadline <= now) {
            return PexAction::DwellElapsed;
        }

        match peer.requester {
            RequestState::Idle { next_request } if next_request <= now => {
                if self.book.need_more_addresses() {
                    peer.requester = RequestState::RequestSent { sent_at: now };
                    trace!(peer_id = %short_id(&peer.id), "Requesting addresses");
                    return PexAction::Send(PexMessage::Request);
                }
                peer.requester = RequestState::Idle {
                    next_request: now + self.request_interval(),
                };
            }
            RequestState::RequestSent { sent_at }
                if sent_at + self.config.ensure_peers_period <= now =>
            {
                debug!(peer_id = %short_id(&peer.id), "Address request timed out");
                peer.requester = RequestState::Idle {
                    next_request: now + self.request_interval(),
                };
            }
            _ => {}
        }
        PexAction::None
    }

    /// Earliest instant at which `poll` has something to do
    pub fn next_deadline(&self, peer: &PexPeer) -> Instant {
        let requester = match peer.requester {
            RequestState::Idle { next_request } => next_request,
            RequestState::RequestSent { sent_at } => sent_at + self.config.ensure_peers_period,
        };
        peer.dwell_deadline.map_or(requester, |dwell| dwell.min(requester))
    }

    fn arm_dwell(&self, peer: &mut PexPeer, now: Instant) {
        if self.config.seed_mode && peer.direction.is_inbound() {
            peer.dwell_deadline = Some(now + self.config.seed_dwell);
        }
    }

    fn request_interval(&self) -> Duration {
        let period = self.config.ensure_peers_period;
        period + rand::thread_rng().gen_range(Duration::ZERO..=period / 10)
    }

    /// Run the outbound dial loop until cancelled
    pub async fn run_dial_loop(
        self: Arc<Self>,
        switch: Switch,
        seeds: Vec<SeedAddress>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.config.ensure_peers_period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.ensure_peers(&switch, &seeds) => {}
            }
        }
        debug!("Dial loop stopped");
    }

    /// One round of the dial loop
    pub async fn ensure_peers(&self, switch: &Switch, seeds: &[SeedAddress]) {
        let now = Instant::now();
        if self.config.seed_mode {
            self.disconnect_old_peers(switch, now);
        }

        let slots = switch.max_outbound().saturating_sub(switch.outbound_slots());
        if slots == 0 {
            trace!("Outbound slots full");
            return;
        }

        let mut exclude = switch.busy_ids();
        exclude.extend(self.backoff.blocked_ids(now));

        let mut targets = Vec::with_capacity(slots);
        while targets.len() < slots {
            let Some(addr) = self.book.pick_address(&exclude) else {
                break;
            };
            exclude.insert(addr.id);
            targets.push(addr);
        }
        // an empty book, or one holding only failed entries, yields nothing
        if targets.is_empty() {
            targets = self.resolve_seeds(seeds, &exclude, slots).await;
        }

        if targets.is_empty() {
            debug!(book_size = self.book.size(), "No addresses to dial");
            return;
        }

        debug!(count = targets.len(), "Dialing peers");
        futures::future::join_all(targets.into_iter().map(|addr| self.dial(switch, addr)))
            .await;
    }

    async fn resolve_seeds(
        &self,
        seeds: &[SeedAddress],
        exclude: &HashSet<PeerId>,
        limit: usize,
    ) -> Vec<NodeAddress> {
        let mut seeds: Vec<_> = seeds
            .iter()
            .filter(|s| !exclude.contains(&s.id))
            .collect();
        seeds.shuffle(&mut rand::thread_rng());

        let mut resolved = Vec::new();
        for seed in seeds {
            if resolved.len() >= limit {
                break;
            }
            match seed.resolve().await {
                Ok(addr) => resolved.push(addr),
                Err(e) => {
                    warn!(host = %seed.host, err = %e, "Failed to resolve seed");
                    self.backoff.record_failure(&seed.id, Instant::now());
                }
            }
        }
        resolved
    }

    async fn dial(&self, switch: &Switch, addr: NodeAddress) {
        match switch.dial_peer(addr).await {
            Ok(()) => {}
            Err(DialError::Transport(e)) => {
                self.book.mark_attempt_failed(&addr.id);
                let failures = self.backoff.record_failure(&addr.id, Instant::now());
                if failures >= MAX_DIAL_ATTEMPTS {
                    warn!(%addr, failures, "Giving up on address");
                    self.book.mark_bad(&addr.id, self.config.ban_duration);
                    self.backoff.reset(&addr.id);
                } else {
                    debug!(%addr, failures, err = %e, "Dial failed");
                }
            }
            Err(e) => trace!(%addr, err = %e, "Dial skipped"),
        }
    }

    fn disconnect_old_peers(&self, switch: &Switch, now: Instant) {
        for peer in switch.peers() {
            let age = now.saturating_duration_since(peer.connected_at);
            if age >= self.config.seed_disconnect_wait {
                info!(peer_id = %short_id(&peer.id), "Disconnecting long lived peer");
                switch.stop_peer(&peer.id);
            }
        }
    }
}
