//! Seed node configuration

use crate::address::NodeAddress;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

/// Default P2P port
pub const DEFAULT_P2P_PORT: u16 = 26656;

/// Default maximum number of inbound peers. Seeds disconnect quickly, so this is high.
pub const DEFAULT_MAX_INBOUND: usize = 1000;

/// Default maximum number of outbound peers
pub const DEFAULT_MAX_OUTBOUND: usize = 10;

/// Default hard cap on addresses carried by a single PEX response
pub const DEFAULT_MAX_PEX_ADDRESSES: usize = 250;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid listen address {0:?}")]
    InvalidListenAddr(String),
    #[error("invalid seed {seed:?}: {reason}")]
    InvalidSeed { seed: String, reason: String },
    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),
    #[error("chain id must not be empty")]
    EmptyChainId,
}

/// Seed node P2P configuration
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Chain / network identifier carried in the handshake
    pub chain_id: String,
    /// Address to listen on
    pub listen_addr: SocketAddr,
    /// Bootstrap seeds (`<id>@<host>:<port>`)
    pub seeds: Vec<String>,
    /// Maximum number of inbound peers
    pub max_inbound: usize,
    /// Maximum number of outbound peers
    pub max_outbound: usize,
    /// Reject non-routable addresses in the address book
    pub addr_book_strict: bool,
    /// Node key file
    pub node_key_file: PathBuf,
    /// Address book file
    pub addr_book_file: PathBuf,
    /// Human readable node name
    pub moniker: String,
    /// Whether to run the seed-mode disconnect policy
    pub seed_mode: bool,
    /// TCP connect timeout for outbound dials
    pub dial_timeout: Duration,
    /// Timeout for the full encrypted + node info handshake
    pub handshake_timeout: Duration,
    /// A session whose frame cannot be written within this time is closed
    pub send_timeout: Duration,
    /// Period of the outbound dial loop and of per-peer address requests
    pub ensure_peers_period: Duration,
    /// Time an inbound peer may stay after an address exchange in seed mode
    pub seed_dwell: Duration,
    /// Maximum session age in seed mode
    pub seed_disconnect_wait: Duration,
    /// Hard cap on addresses in one PEX response
    pub max_pex_addresses: usize,
    /// How often the address book is flushed to disk
    pub save_interval: Duration,
}

impl P2pConfig {
    /// Create new config for a chain
    pub fn new(chain_id: impl Into<String>) -> Self {
        let chain_id = chain_id.into();
        Self {
            moniker: format!("{chain_id}-seed"),
            chain_id,
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_P2P_PORT),
            seeds: Vec::new(),
            max_inbound: DEFAULT_MAX_INBOUND,
            max_outbound: DEFAULT_MAX_OUTBOUND,
            addr_book_strict: true,
            node_key_file: PathBuf::from("config/node_key.json"),
            addr_book_file: PathBuf::from("data/addrbook.json"),
            seed_mode: true,
            dial_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(20),
            send_timeout: Duration::from_secs(10),
            ensure_peers_period: Duration::from_secs(30),
            seed_dwell: Duration::from_secs(10),
            seed_disconnect_wait: Duration::from_secs(3 * 60 * 60),
            max_pex_addresses: DEFAULT_MAX_PEX_ADDRESSES,
            save_interval: Duration::from_secs(120),
        }
    }

    /// Set listen address
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Set listen port
    pub fn with_port(mut self, port: u16) -> Self {
        self.listen_addr.set_port(port);
        self
    }

    /// Set seeds from a comma separated list
    pub fn with_seeds(mut self, seeds: &str) -> Self {
        self.seeds = split_and_trim_empty(seeds, ",", " ");
        self
    }

    /// Set peer limits
    pub fn with_limits(mut self, max_inbound: usize, max_outbound: usize) -> Self {
        self.max_inbound = max_inbound;
        self.max_outbound = max_outbound;
        self
    }

    /// Set address book strict mode
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.addr_book_strict = strict;
        self
    }

    /// Set node key file
    pub fn with_node_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.node_key_file = path.into();
        self
    }

    /// Set address book file
    pub fn with_addr_book_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.addr_book_file = path.into();
        self
    }

    /// Set the seed-mode dwell time
    pub fn with_seed_dwell(mut self, dwell: Duration) -> Self {
        self.seed_dwell = dwell;
        self
    }

    /// Set the dial loop / request period
    pub fn with_ensure_peers_period(mut self, period: Duration) -> Self {
        self.ensure_peers_period = period;
        self
    }

    /// Set the PEX response cap
    pub fn with_max_pex_addresses(mut self, max: usize) -> Self {
        self.max_pex_addresses = max;
        self
    }

    /// Validate limits and parse every seed entry.
    pub fn validate(&self) -> Result<Vec<SeedAddress>, ConfigError> {
        if self.chain_id.is_empty() {
            return Err(ConfigError::EmptyChainId);
        }
        if self.max_inbound == 0 {
            return Err(ConfigError::ZeroLimit("max_inbound"));
        }
        if self.max_outbound == 0 {
            return Err(ConfigError::ZeroLimit("max_outbound"));
        }
        if self.max_pex_addresses == 0 {
            return Err(ConfigError::ZeroLimit("max_pex_addresses"));
        }
        self.seeds.iter().map(|s| SeedAddress::parse(s)).collect()
    }
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self::new("some-chain-id")
    }
}

/// A bootstrap seed. The host may be a DNS name and is resolved on every dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedAddress {
    pub id: reth_network_peers::PeerId,
    pub host: String,
    pub port: u16,
}

impl SeedAddress {
    /// Parse `<hex id>@<host>:<port>`
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidSeed {
            seed: s.to_string(),
            reason: reason.to_string(),
        };

        let (id, host_port) = s.split_once('@').ok_or_else(|| invalid("missing node id"))?;
        let id = crate::address::parse_peer_id(id).map_err(|e| invalid(&e.to_string()))?;
        let (host, port) = host_port.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;
        if port == 0 {
            return Err(invalid("invalid port"));
        }

        Ok(Self {
            id,
            host: host.to_string(),
            port,
        })
    }

    /// Resolve the host into a dialable address
    pub async fn resolve(&self) -> std::io::Result<NodeAddress> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port)).await?;
        addrs
            .next()
            .map(|addr| NodeAddress::new(self.id, addr))
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no address for host")
            })
    }
}

/// Parse a listen address, accepting an optional `tcp://` prefix.
pub fn parse_listen_addr(s: &str) -> Result<SocketAddr, ConfigError> {
    let trimmed = s.trim();
    let bare = trimmed.strip_prefix("tcp://").unwrap_or(trimmed);
    bare.parse().map_err(|_| ConfigError::InvalidListenAddr(s.to_string()))
}

/// Split `s` by `sep`, trim every element by any character in `cutset` and
/// drop empty elements.
pub fn split_and_trim_empty(s: &str, sep: &str, cutset: &str) -> Vec<String> {
    if s.is_empty() {
        return Vec::new();
    }

    s.split(sep)
        .map(|part| part.trim_matches(|c| cutset.contains(c)))
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
