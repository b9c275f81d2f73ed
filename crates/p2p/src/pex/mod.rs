//! Peer exchange
//!
//! The reactor asks connected peers for addresses, answers their requests from
//! the address book and drives outbound dialing. In seed mode it also sheds
//! peers once they have been served.

mod message;
mod reactor;

pub use message::{PexMessage, WireAddress, PEX_ADDRS, PEX_REQUEST};
pub use reactor::{PexAction, PexConfig, PexPeer, PexReactor, RequestState};

use std::time::Duration;

/// Protocol violations; each one ends the offending session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PexError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("response carries {got} addresses, limit is {max}")]
    TooManyAddresses { got: usize, max: usize },
    #[error("unsolicited address response")]
    Unsolicited,
    #[error("address request {elapsed:?} after the previous one")]
    RequestTooFrequent { elapsed: Duration },
}
