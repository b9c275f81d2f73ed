//! Address book entries

use crate::address::NodeAddress;
use reth_network_peers::PeerId;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Quality partition of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketType {
    /// Heard of, never verified
    New,
    /// Had at least one verified session
    Old,
}

/// A known peer address with its bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownAddress {
    /// Dialable address, last one seen for this id
    pub addr: NodeAddress,
    /// Peer that told us about this address
    pub src: PeerId,
    /// Current bucket class
    pub bucket_type: BucketType,
    /// Consecutive failed dial attempts
    pub attempts: u32,
    /// Unix seconds of the last dial attempt
    pub last_attempt: Option<u64>,
    /// Unix seconds of the last verified session
    pub last_success: Option<u64>,
    /// Bucket index inside its class; recomputed on load
    #[serde(skip)]
    pub(crate) bucket: usize,
}

impl KnownAddress {
    /// Create a fresh entry in the new class
    pub fn new(addr: NodeAddress, src: PeerId) -> Self {
        Self {
            addr,
            src,
            bucket_type: BucketType::New,
            attempts: 0,
            last_attempt: None,
            last_success: None,
            bucket: 0,
        }
    }

    /// Node id of this entry
    pub fn id(&self) -> PeerId {
        self.addr.id
    }

    pub fn is_old(&self) -> bool {
        self.bucket_type == BucketType::Old
    }

    pub fn is_new(&self) -> bool {
        self.bucket_type == BucketType::New
    }

    /// Too many consecutive failures; evicted first and never handed out.
    pub fn is_bad(&self, max_failed_attempts: u32) -> bool {
        self.attempts >= max_failed_attempts
    }

    pub(crate) fn mark_attempt(&mut self, now: u64) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt = Some(now);
    }

    pub(crate) fn mark_good(&mut self, now: u64) {
        self.attempts = 0;
        self.last_attempt = Some(now);
        self.last_success = Some(now);
    }

    /// Ordering key for eviction, smallest goes first: bad entries, then oldest
    /// `last_success`, then oldest `last_attempt`, then lowest id.
    pub(crate) fn eviction_key(&self, max_failed_attempts: u32) -> (bool, u64, u64, PeerId) {
        (
            !self.is_bad(max_failed_attempts),
            self.last_success.unwrap_or(0),
            self.last_attempt.unwrap_or(0),
            self.addr.id,
        )
    }
}

/// Current unix time in seconds
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B512;

    fn known(byte: u8) -> KnownAddress {
        let addr = NodeAddress::new(B512::repeat_byte(byte), "1.2.3.4:26656".parse().unwrap());
        KnownAddress::new(addr, B512::repeat_byte(0xff))
    }

    #[test]
    fn test_attempts_and_success() {
        let mut k = known(1);
        assert!(k.is_new());
        assert!(!k.is_bad(3));

        k.mark_attempt(10);
        k.mark_attempt(11);
        k.mark_attempt(12);
        assert_eq!(k.attempts, 3);
        assert_eq!(k.last_attempt, Some(12));
        assert!(k.is_bad(3));

        k.mark_good(20);
        assert_eq!(k.attempts, 0);
        assert_eq!(k.last_success, Some(20));
        assert!(!k.is_bad(3));
    }

    #[test]
    fn test_eviction_order() {
        let mut bad = known(1);
        for t in 0..3 {
            bad.mark_attempt(100 + t);
        }
        let mut succeeded = known(2);
        succeeded.mark_good(50);
        let mut attempted = known(3);
        attempted.mark_attempt(40);
        let never = known(4);

        let mut entries = vec![
            succeeded.clone(),
            attempted.clone(),
            never.clone(),
            bad.clone(),
        ];
        entries.sort_by_key(|k| k.eviction_key(3));
        let order: Vec<_> = entries.iter().map(|k| k.id()).collect();
        assert_eq!(
            order,
            vec![bad.id(), never.id(), attempted.id(), succeeded.id()]
        );
    }

    #[test]
    fn test_serde_roundtrip_keeps_fields() {
        let mut k = known(9);
        k.mark_attempt(5);
        k.bucket_type = BucketType::Old;
        let json = serde_json::to_string(&k).unwrap();
        assert!(json.contains("\"old\""));
        let back: KnownAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, k);
    }
}
