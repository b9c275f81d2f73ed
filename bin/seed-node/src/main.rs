//! seed-node binary
//!
//! Runs a peer exchange seed: accepts many short lived connections, hands out
//! addresses, crawls the network and persists what it learns.

use clap::Parser;
use seed_p2p::{
    config::{parse_listen_addr, DEFAULT_MAX_INBOUND, DEFAULT_MAX_OUTBOUND},
    AddrBookConfig, AddressBook, NodeKey, P2pConfig, Switch,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// seed-node command line arguments
#[derive(Debug, Parser)]
#[clap(name = "seed-node", about = "seed-node - peer exchange seed")]
struct Cli {
    /// Home directory; relative key and address book paths are resolved against it
    #[clap(long, default_value = ".")]
    home: PathBuf,

    /// Chain id announced in the handshake
    #[clap(long, default_value = "some-chain-id")]
    chain_id: String,

    /// Listen address
    #[clap(long, default_value = "tcp://0.0.0.0:26656")]
    listen: String,

    /// Comma separated seeds (`<id>@<host>:<port>`)
    #[clap(long, default_value = "")]
    seeds: String,

    /// Maximum number of inbound peers
    #[clap(long, default_value_t = DEFAULT_MAX_INBOUND)]
    max_inbound: usize,

    /// Maximum number of outbound peers
    #[clap(long, default_value_t = DEFAULT_MAX_OUTBOUND)]
    max_outbound: usize,

    /// Reject non-routable addresses
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    addr_book_strict: bool,

    /// Node key file
    #[clap(long, default_value = "config/node_key.json")]
    node_key_file: PathBuf,

    /// Address book file
    #[clap(long, default_value = "data/addrbook.json")]
    addr_book_file: PathBuf,

    /// Log level
    #[clap(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn p2p_config(&self) -> eyre::Result<P2pConfig> {
        let node_key_file = resolve(&self.home, &self.node_key_file);
        let addr_book_file = resolve(&self.home, &self.addr_book_file);
        for path in [&node_key_file, &addr_book_file] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        Ok(P2pConfig::new(&self.chain_id)
            .with_listen_addr(parse_listen_addr(&self.listen)?)
            .with_seeds(&self.seeds)
            .with_limits(self.max_inbound, self.max_outbound)
            .with_strict(self.addr_book_strict)
            .with_node_key_file(node_key_file)
            .with_addr_book_file(addr_book_file))
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level)?;

    let config = cli.p2p_config()?;
    let node_key = NodeKey::load_or_generate(&config.node_key_file)?;

    tracing::info!(
        key = %node_key.id(),
        listen = %config.listen_addr,
        chain = %config.chain_id,
        strict_routing = config.addr_book_strict,
        max_inbound = config.max_inbound,
        max_outbound = config.max_outbound,
        "seed-node"
    );

    let book = open_book(&config, &node_key)?;

    let switch = Switch::start(config, node_key, Arc::clone(&book)).await?;
    tracing::info!(
        listen_addr = %switch.local_addr(),
        known_addrs = book.size(),
        "Press Ctrl+C to stop"
    );

    wait_for_shutdown_signal().await?;

    tracing::info!("Shutting down seed-node...");
    switch.stop().await;
    // every session has closed; nothing mutates the book any more
    if let Err(e) = book.save() {
        tracing::error!(err = %e, "Failed to save address book");
    }

    tracing::info!("seed-node stopped.");
    Ok(())
}

/// Load the persisted address book; our own id never enters it
fn open_book(config: &P2pConfig, node_key: &NodeKey) -> eyre::Result<Arc<AddressBook>> {
    let book = AddressBook::new(
        &config.addr_book_file,
        AddrBookConfig::new(config.addr_book_strict),
    );
    book.add_our_id(node_key.id());
    book.load()?;
    Ok(Arc::new(book))
}

fn resolve(home: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        home.join(path)
    }
}

fn init_tracing(level: &str) -> eyre::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| eyre::eyre!("Failed to initialize tracing: {}", e))?;

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_shutdown_signal() -> eyre::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received Ctrl+C");
    }

    Ok(())
}
