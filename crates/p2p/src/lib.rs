//! Seed node P2P networking
//!
//! A seed node helps new participants of a gossip network find live peers. It
//! never relays application data; it only collects and hands out addresses.
//!
//! # Components
//!
//! - [`identity`]: persistent node key and the derived node id
//! - [`transport`]: encrypted, authenticated connections with a signed node info handshake
//! - [`addrbook`]: bucketed, persisted store of known addresses
//! - [`pex`]: peer exchange protocol and the outbound dial loop
//! - [`switch`]: listener, peer table and session lifecycle
//!
//! # Example
//!
//! ```ignore
//! use seed_p2p::{AddrBookConfig, AddressBook, NodeKey, P2pConfig, Switch};
//! use std::sync::Arc;
//!
//! let config = P2pConfig::new("my-chain").with_seeds("<id>@seed.example.com:26656");
//! let node_key = NodeKey::load_or_generate(&config.node_key_file)?;
//! let book = AddressBook::new(&config.addr_book_file, AddrBookConfig::new(true));
//! book.add_our_id(node_key.id());
//! book.load()?;
//! let book = Arc::new(book);
//!
//! let switch = Switch::start(config, node_key, Arc::clone(&book)).await?;
//! // ...
//! switch.stop().await;
//! book.save()?;
//! ```

pub mod addrbook;
pub mod address;
pub mod backoff;
pub mod config;
pub mod identity;
pub mod peer;
pub mod pex;
pub mod switch;
pub mod transport;

pub use addrbook::{AddrBookConfig, AddrBookError, AddressBook, BucketType, KnownAddress};
pub use address::{AddressError, NodeAddress};
pub use config::{ConfigError, P2pConfig, SeedAddress, DEFAULT_P2P_PORT};
pub use identity::{IdentityError, NodeKey};
pub use peer::{PeerInfo, PeerTable, PeerTableError};
pub use pex::{PexError, PexMessage, PexReactor};
pub use switch::{DialError, Switch, SwitchError};
pub use transport::{Connection, Direction, NodeInfo, Transport, TransportError, PEX_CHANNEL};

/// Re-export reth network peer types
pub use reth_network_peers::{pk2id, PeerId};
