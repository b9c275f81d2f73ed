//! Bucketed address book.
//!
//! Known addresses are split into two classes: `New` (heard about from some
//! source) and `Old` (had a verified session). Every class is a fixed number of
//! fixed size buckets. Bucket assignment is a keyed hash of the address id and
//! its source, salted with a random per-book key that is persisted alongside the
//! entries, so placement is stable across restarts but not predictable by peers.
//!
//! All state lives behind a single mutex; every public method takes it once and
//! releases it before returning, so concurrent sessions observe linearizable
//! updates and `pick_address` always sees complete buckets.

mod file;
mod known;

pub use known::{BucketType, KnownAddress};

use crate::address::NodeAddress;
use alloy_primitives::{keccak256, B256};
use known::now_secs;
use parking_lot::{Mutex, RwLock};
use rand::{seq::SliceRandom, Rng};
use reth_network_peers::PeerId;
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tracing::{debug, trace};

/// Number of new buckets
pub const NEW_BUCKET_COUNT: usize = 256;
/// Capacity of one new bucket
pub const NEW_BUCKET_SIZE: usize = 64;
/// Number of old buckets
pub const OLD_BUCKET_COUNT: usize = 64;
/// Capacity of one old bucket
pub const OLD_BUCKET_SIZE: usize = 64;
/// How many distinct new buckets a single source can reach
pub const NEW_BUCKETS_PER_SOURCE: u64 = 32;
/// Below this many entries the book asks for more
pub const NEED_ADDRESS_THRESHOLD: usize = 1000;

/// Address book errors
#[derive(Debug, thiserror::Error)]
pub enum AddrBookError {
    #[error("address {0} is invalid")]
    Invalid(NodeAddress),
    #[error("address {0} is not routable")]
    NonRoutable(NodeAddress),
    #[error("address {0} is banned")]
    Banned(NodeAddress),
    #[error("address book io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt address book {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// Address book tunables
#[derive(Debug, Clone)]
pub struct AddrBookConfig {
    /// Reject non-routable addresses
    pub strict: bool,
    pub new_bucket_count: usize,
    pub new_bucket_size: usize,
    pub old_bucket_count: usize,
    pub old_bucket_size: usize,
    /// Total cap across both classes
    pub max_addresses: usize,
    /// Failures after which an entry is bad
    pub max_failed_attempts: u32,
    /// `need_more_addresses` is true below this size
    pub need_address_threshold: usize,
    /// Weight (percent) of new entries in `pick_address`
    pub bias_towards_new: u32,
    /// Share of the book offered in one selection
    pub get_selection_percent: usize,
    pub min_get_selection: usize,
    pub max_get_selection: usize,
}

impl AddrBookConfig {
    /// Default tunables with the given strict mode
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            new_bucket_count: NEW_BUCKET_COUNT,
            new_bucket_size: NEW_BUCKET_SIZE,
            old_bucket_count: OLD_BUCKET_COUNT,
            old_bucket_size: OLD_BUCKET_SIZE,
            max_addresses: NEW_BUCKET_COUNT * NEW_BUCKET_SIZE
                + OLD_BUCKET_COUNT * OLD_BUCKET_SIZE,
            max_failed_attempts: 3,
            need_address_threshold: NEED_ADDRESS_THRESHOLD,
            bias_towards_new: 30,
            get_selection_percent: 23,
            min_get_selection: 32,
            max_get_selection: 250,
        }
    }

    /// Set bucket geometry
    pub fn with_buckets(
        mut self,
        new_count: usize,
        new_size: usize,
        old_count: usize,
        old_size: usize,
    ) -> Self {
        self.new_bucket_count = new_count.max(1);
        self.new_bucket_size = new_size.max(1);
        self.old_bucket_count = old_count.max(1);
        self.old_bucket_size = old_size.max(1);
        self
    }

    /// Set total cap
    pub fn with_max_addresses(mut self, max: usize) -> Self {
        self.max_addresses = max.max(1);
        self
    }
}

impl Default for AddrBookConfig {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Everything guarded by the book mutex
#[derive(Debug)]
struct BookState {
    key: B256,
    addrs: HashMap<PeerId, KnownAddress>,
    new_buckets: Vec<HashSet<PeerId>>,
    old_buckets: Vec<HashSet<PeerId>>,
    banned: HashMap<PeerId, Instant>,
}

impl BookState {
    fn new(key: B256, config: &AddrBookConfig) -> Self {
        Self {
            key,
            addrs: HashMap::new(),
            new_buckets: vec![HashSet::new(); config.new_bucket_count],
            old_buckets: vec![HashSet::new(); config.old_bucket_count],
            banned: HashMap::new(),
        }
    }

    fn keyed_hash(&self, parts: &[&[u8]]) -> u64 {
        let mut buf = Vec::with_capacity(32 + parts.iter().map(|p| p.len()).sum::<usize>());
        buf.extend_from_slice(self.key.as_slice());
        for part in parts {
            buf.extend_from_slice(part);
        }
        let hash = keccak256(&buf);
        let mut word = [0u8; 8];
        word.copy_from_slice(&hash[..8]);
        u64::from_be_bytes(word)
    }

    /// Two level hash: a source first picks one of `NEW_BUCKETS_PER_SOURCE`
    /// slots for this id, the slot is then mapped onto the bucket range. One
    /// source can therefore never spread over more than that many buckets.
    fn new_bucket_index(&self, id: &PeerId, src: &PeerId, count: usize) -> usize {
        let slot =
            self.keyed_hash(&[&b"new"[..], id.as_slice(), src.as_slice()]) % NEW_BUCKETS_PER_SOURCE;
        let hash = self.keyed_hash(&[&b"new-src"[..], src.as_slice(), &slot.to_be_bytes()[..]]);
        (hash % count as u64) as usize
    }

    fn old_bucket_index(&self, id: &PeerId, count: usize) -> usize {
        (self.keyed_hash(&[&b"old"[..], id.as_slice()]) % count as u64) as usize
    }

    fn bucket_mut(&mut self, bucket_type: BucketType, index: usize) -> &mut HashSet<PeerId> {
        match bucket_type {
            BucketType::New => &mut self.new_buckets[index],
            BucketType::Old => &mut self.old_buckets[index],
        }
    }

    /// Lowest eviction key among `ids`
    fn worst<'a>(
        &self,
        ids: impl Iterator<Item = &'a PeerId>,
        max_failed_attempts: u32,
    ) -> Option<PeerId> {
        ids.filter_map(|id| self.addrs.get(id))
            .min_by_key(|known| known.eviction_key(max_failed_attempts))
            .map(|known| known.id())
    }

    fn remove(&mut self, id: &PeerId) -> Option<KnownAddress> {
        let known = self.addrs.remove(id)?;
        self.bucket_mut(known.bucket_type, known.bucket).remove(id);
        Some(known)
    }

    fn evict(&mut self, id: &PeerId) {
        if let Some(known) = self.remove(id) {
            debug!(addr = %known.addr, bucket = ?known.bucket_type, "Evicted address");
        }
    }

    /// Make room for one insertion into new bucket `bucket`, evicting at most one entry.
    fn make_room_in_new(&mut self, bucket: usize, config: &AddrBookConfig) {
        let victim = if self.new_buckets[bucket].len() >= config.new_bucket_size {
            self.worst(self.new_buckets[bucket].iter(), config.max_failed_attempts)
        } else if self.addrs.len() >= config.max_addresses {
            let news = self.addrs.values().filter(|k| k.is_new()).map(|k| &k.addr.id);
            self.worst(news, config.max_failed_attempts)
                .or_else(|| self.worst(self.addrs.keys(), config.max_failed_attempts))
        } else {
            None
        };

        if let Some(victim) = victim {
            self.evict(&victim);
        }
    }

    fn insert_new(&mut self, mut known: KnownAddress, config: &AddrBookConfig) {
        let bucket = self.new_bucket_index(&known.addr.id, &known.src, config.new_bucket_count);
        self.make_room_in_new(bucket, config);
        known.bucket_type = BucketType::New;
        known.bucket = bucket;
        self.new_buckets[bucket].insert(known.id());
        self.addrs.insert(known.id(), known);
    }

    /// Place an entry into the old class. A full old bucket demotes its worst
    /// entry back into the new class.
    fn insert_old(&mut self, mut known: KnownAddress, config: &AddrBookConfig) {
        let bucket = self.old_bucket_index(&known.addr.id, config.old_bucket_count);
        if self.old_buckets[bucket].len() >= config.old_bucket_size {
            let victim = self.worst(self.old_buckets[bucket].iter(), config.max_failed_attempts);
            if let Some(demoted) = victim.and_then(|victim| self.remove(&victim)) {
                trace!(addr = %demoted.addr, "Demoting old address to new");
                self.insert_new(demoted, config);
            }
        }
        known.bucket_type = BucketType::Old;
        known.bucket = bucket;
        self.old_buckets[bucket].insert(known.id());
        self.addrs.insert(known.id(), known);
    }

    fn is_banned(&mut self, id: &PeerId, now: Instant) -> bool {
        match self.banned.get(id) {
            Some(until) if *until > now => true,
            Some(_) => {
                self.banned.remove(id);
                false
            }
            None => false,
        }
    }
}

/// Durable, bucketed store of known peer addresses
#[derive(Debug)]
pub struct AddressBook {
    config: AddrBookConfig,
    path: PathBuf,
    our_ids: RwLock<HashSet<PeerId>>,
    state: Mutex<BookState>,
    save_lock: Mutex<()>,
}

impl AddressBook {
    /// Create an empty book persisted at `path`
    pub fn new(path: impl Into<PathBuf>, config: AddrBookConfig) -> Self {
        let key = B256::random();
        Self {
            state: Mutex::new(BookState::new(key, &config)),
            config,
            path: path.into(),
            our_ids: RwLock::new(HashSet::new()),
            save_lock: Mutex::new(()),
        }
    }

    /// Book configuration
    pub fn config(&self) -> &AddrBookConfig {
        &self.config
    }

    /// File the book is persisted to
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register one of our own ids; it will never be stored.
    pub fn add_our_id(&self, id: PeerId) {
        self.our_ids.write().insert(id);
    }

    /// Whether `id` is one of ours
    pub fn is_our_id(&self, id: &PeerId) -> bool {
        self.our_ids.read().contains(id)
    }

    /// Insert a new address or refresh an existing one.
    ///
    /// Returns `Ok(true)` when a new entry was created. Our own ids are ignored.
    pub fn add_address(&self, addr: NodeAddress, src: PeerId) -> Result<bool, AddrBookError> {
        if self.is_our_id(&addr.id) {
            return Ok(false);
        }
        if !addr.is_valid() {
            return Err(AddrBookError::Invalid(addr));
        }
        if self.config.strict && !addr.is_routable() {
            return Err(AddrBookError::NonRoutable(addr));
        }

        let mut state = self.state.lock();
        if state.is_banned(&addr.id, Instant::now()) {
            return Err(AddrBookError::Banned(addr));
        }
        if let Some(known) = state.addrs.get_mut(&addr.id) {
            // last seen address wins
            known.addr = addr;
            return Ok(false);
        }

        state.insert_new(KnownAddress::new(addr, src), &self.config);
        trace!(%addr, "Added address");
        Ok(true)
    }

    /// Record a verified session. Promotes a new entry to the old class.
    pub fn mark_good(&self, id: &PeerId) -> bool {
        self.mark_good_at(id, now_secs())
    }

    pub(crate) fn mark_good_at(&self, id: &PeerId, now: u64) -> bool {
        let mut state = self.state.lock();
        let Some(known) = state.addrs.get_mut(id) else {
            return false;
        };
        known.mark_good(now);
        if known.is_old() {
            return true;
        }

        if let Some(known) = state.remove(id) {
            debug!(addr = %known.addr, "Promoting address to old");
            state.insert_old(known, &self.config);
        }
        true
    }

    /// Record a failed dial attempt
    pub fn mark_attempt_failed(&self, id: &PeerId) -> bool {
        self.mark_attempt_failed_at(id, now_secs())
    }

    pub(crate) fn mark_attempt_failed_at(&self, id: &PeerId, now: u64) -> bool {
        let mut state = self.state.lock();
        match state.addrs.get_mut(id) {
            Some(known) => {
                known.mark_attempt(now);
                true
            }
            None => false,
        }
    }

    /// Remove an address and refuse it for `ban` from now
    pub fn mark_bad(&self, id: &PeerId, ban: Duration) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.remove(id);
        state.banned.retain(|_, until| *until > now);
        state.banned.insert(*id, now + ban);
    }

    /// Remove an address
    pub fn remove_address(&self, id: &PeerId) -> Option<KnownAddress> {
        self.state.lock().remove(id)
    }

    /// Pick a random address, preferring old entries, skipping `exclude` and bad entries.
    pub fn pick_address(&self, exclude: &HashSet<PeerId>) -> Option<NodeAddress> {
        let state = self.state.lock();
        let max_failed = self.config.max_failed_attempts;

        let (mut news, mut olds) = (Vec::new(), Vec::new());
        for known in state.addrs.values() {
            if exclude.contains(&known.addr.id) || known.is_bad(max_failed) {
                continue;
            }
            match known.bucket_type {
                BucketType::New => news.push(known.addr),
                BucketType::Old => olds.push(known.addr),
            }
        }
        drop(state);

        let mut rng = rand::thread_rng();
        let bias = self.config.bias_towards_new.min(100) as f64;
        let new_weight = (news.len() as f64).sqrt() * bias;
        let old_weight = (olds.len() as f64).sqrt() * (100.0 - bias);

        let pick_old = match (news.is_empty(), olds.is_empty()) {
            (true, true) => return None,
            (true, false) => true,
            (false, true) => false,
            (false, false) => rng.gen::<f64>() * (new_weight + old_weight) < old_weight,
        };

        let candidates = if pick_old { &olds } else { &news };
        candidates.choose(&mut rng).copied()
    }

    /// Random sample of good addresses to hand out in a PEX response.
    pub fn get_selection(&self, exclude: &HashSet<PeerId>, cap: usize) -> Vec<NodeAddress> {
        let state = self.state.lock();
        let max_failed = self.config.max_failed_attempts;
        let mut eligible: Vec<NodeAddress> = state
            .addrs
            .values()
            .filter(|k| !k.is_bad(max_failed) && !exclude.contains(&k.addr.id))
            .map(|k| k.addr)
            .collect();
        let total = state.addrs.len();
        drop(state);

        let wanted = (total * self.config.get_selection_percent / 100)
            .max(self.config.min_get_selection)
            .min(self.config.max_get_selection)
            .min(cap)
            .min(eligible.len());

        let mut rng = rand::thread_rng();
        let (selection, _) = eligible.partial_shuffle(&mut rng, wanted);
        selection.to_vec()
    }

    /// Entry for `id`, if known
    pub fn get(&self, id: &PeerId) -> Option<KnownAddress> {
        self.state.lock().addrs.get(id).cloned()
    }

    /// Whether `id` is known
    pub fn has(&self, id: &PeerId) -> bool {
        self.state.lock().addrs.contains_key(id)
    }

    /// Number of stored addresses
    pub fn size(&self) -> usize {
        self.state.lock().addrs.len()
    }

    /// Number of (new, old) entries
    pub fn class_sizes(&self) -> (usize, usize) {
        let state = self.state.lock();
        let old = state.addrs.values().filter(|k| k.is_old()).count();
        (state.addrs.len() - old, old)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Whether the PEX reactor should keep soliciting addresses
    pub fn need_more_addresses(&self) -> bool {
        self.size() < self.config.need_address_threshold
    }

    /// Consistent copy of every entry
    pub fn entries(&self) -> Vec<KnownAddress> {
        self.state.lock().addrs.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B512;

    fn id(n: u16) -> PeerId {
        let mut bytes = [0u8; 64];
        bytes[..2].copy_from_slice(&n.to_be_bytes());
        bytes[63] = 1;
        B512::from(bytes)
    }

    fn addr(n: u16) -> NodeAddress {
        let [hi, lo] = n.to_be_bytes();
        NodeAddress::new(id(n), format!("8.8.{hi}.{lo}:26656").parse().unwrap())
    }

    fn book(config: AddrBookConfig) -> AddressBook {
        AddressBook::new("/nonexistent/addrbook.json", config)
    }

    #[test]
    fn test_empty_book() {
        let book = book(AddrBookConfig::default());
        assert!(book.is_empty());
        assert!(book.need_more_addresses());
        assert!(book.pick_address(&HashSet::new()).is_none());
        assert!(book.get_selection(&HashSet::new(), 250).is_empty());
    }

    #[test]
    fn test_add_and_refresh() {
        let book = book(AddrBookConfig::default());
        let src = id(999);

        assert!(book.add_address(addr(1), src).unwrap());
        assert!(!book.add_address(addr(1), src).unwrap());
        assert_eq!(book.size(), 1);

        // Same id, new socket address: replaces the stored one
        let moved = NodeAddress::new(id(1), "9.9.9.9:1234".parse().unwrap());
        assert!(!book.add_address(moved, src).unwrap());
        assert_eq!(book.size(), 1);
        assert_eq!(book.get(&id(1)).unwrap().addr.addr, moved.addr);
    }

    #[test]
    fn test_own_address_is_noop() {
        let book = book(AddrBookConfig::default());
        book.add_our_id(id(1));
        assert!(!book.add_address(addr(1), id(2)).unwrap());
        assert!(book.is_empty());
    }

    #[test]
    fn test_strict_mode() {
        let strict = book(AddrBookConfig::new(true));
        let local = NodeAddress::new(id(1), "127.0.0.1:26656".parse().unwrap());
        assert!(matches!(
            strict.add_address(local, id(2)),
            Err(AddrBookError::NonRoutable(_))
        ));

        let lax = book(AddrBookConfig::new(false));
        assert!(lax.add_address(local, id(2)).unwrap());

        let unspecified = NodeAddress::new(id(3), "0.0.0.0:26656".parse().unwrap());
        assert!(matches!(
            lax.add_address(unspecified, id(2)),
            Err(AddrBookError::Invalid(_))
        ));
    }

    #[test]
    fn test_bucket_assignment_is_deterministic() {
        let book = book(AddrBookConfig::default());
        let state = book.state.lock();
        let a = state.new_bucket_index(&id(1), &id(2), NEW_BUCKET_COUNT);
        let b = state.new_bucket_index(&id(1), &id(2), NEW_BUCKET_COUNT);
        assert_eq!(a, b);
        assert_eq!(
            state.old_bucket_index(&id(1), OLD_BUCKET_COUNT),
            state.old_bucket_index(&id(1), OLD_BUCKET_COUNT)
        );
    }

    #[test]
    fn test_single_source_reaches_limited_buckets() {
        let book = book(AddrBookConfig::default());
        let state = book.state.lock();
        let src = id(4242);
        let buckets: HashSet<usize> = (0..2000)
            .map(|n| state.new_bucket_index(&id(n), &src, NEW_BUCKET_COUNT))
            .collect();
        assert!(buckets.len() <= NEW_BUCKETS_PER_SOURCE as usize);
    }

    #[test]
    fn test_total_capacity_evicts_exactly_one() {
        let config = AddrBookConfig::new(true).with_max_addresses(10);
        let book = book(config);

        for n in 0..10 {
            book.add_address(addr(n), id(1000 + n)).unwrap();
        }
        assert_eq!(book.size(), 10);

        // Give every entry a success except entry 3, which makes it the oldest
        for n in 0..10 {
            if n != 3 {
                book.mark_attempt_failed_at(&id(n), 100);
                let mut state = book.state.lock();
                let known = state.addrs.get_mut(&id(n)).unwrap();
                known.last_success = Some(200);
                known.attempts = 0;
            }
        }

        assert!(book.add_address(addr(50), id(2000)).unwrap());
        assert_eq!(book.size(), 10);
        assert!(!book.has(&id(3)));
        assert!(book.has(&id(50)));
    }

    #[test]
    fn test_full_bucket_evicts_oldest_then_attempt_tiebreak() {
        let config = AddrBookConfig::new(true).with_buckets(1, 3, 1, 3);
        let book = book(config);

        for n in 1..=3 {
            book.add_address(addr(n), id(900)).unwrap();
        }
        {
            let mut state = book.state.lock();
            // equal last_success, entry 2 has the oldest last_attempt
            for (n, attempt) in [(1u16, 30u64), (2, 10), (3, 20)] {
                let known = state.addrs.get_mut(&id(n)).unwrap();
                known.last_success = Some(5);
                known.last_attempt = Some(attempt);
            }
        }

        book.add_address(addr(4), id(900)).unwrap();
        assert_eq!(book.size(), 3);
        assert!(!book.has(&id(2)));
        assert!(book.has(&id(1)) && book.has(&id(3)) && book.has(&id(4)));
    }

    #[test]
    fn test_bad_entries_evicted_first() {
        let config = AddrBookConfig::new(true).with_buckets(1, 2, 1, 2);
        let book = book(config);

        book.add_address(addr(1), id(900)).unwrap();
        book.add_address(addr(2), id(900)).unwrap();
        book.mark_good_at(&id(2), 10);
        book.add_address(addr(3), id(900)).unwrap();
        for t in 0..3 {
            book.mark_attempt_failed_at(&id(3), 500 + t);
        }
        book.state.lock().addrs.get_mut(&id(3)).unwrap().last_success = Some(1000);

        book.add_address(addr(4), id(900)).unwrap();
        assert!(!book.has(&id(3)), "bad entry should go first");
        assert!(book.has(&id(1)));
    }

    #[test]
    fn test_mark_good_promotes() {
        let book = book(AddrBookConfig::default());
        book.add_address(addr(1), id(2)).unwrap();
        assert_eq!(book.class_sizes(), (1, 0));

        assert!(book.mark_good(&id(1)));
        assert_eq!(book.class_sizes(), (0, 1));
        let known = book.get(&id(1)).unwrap();
        assert_eq!(known.bucket_type, BucketType::Old);
        assert!(known.last_success.is_some());

        assert!(!book.mark_good(&id(77)));
    }

    #[test]
    fn test_full_old_bucket_demotes() {
        let config = AddrBookConfig::new(true).with_buckets(4, 8, 1, 2);
        let book = book(config);
        for n in 1..=3 {
            book.add_address(addr(n), id(900)).unwrap();
        }
        book.mark_good_at(&id(1), 10);
        book.mark_good_at(&id(2), 20);
        book.mark_good_at(&id(3), 30);

        assert_eq!(book.size(), 3);
        assert_eq!(book.class_sizes(), (1, 2));
        assert!(book.get(&id(1)).unwrap().is_new());
    }

    #[test]
    fn test_pick_address_respects_exclusions() {
        let book = book(AddrBookConfig::default());
        for n in 0..20 {
            book.add_address(addr(n), id(500)).unwrap();
        }
        for n in 0..5 {
            book.mark_good(&id(n));
        }

        let exclude: HashSet<_> = (0..19).map(id).collect();
        for _ in 0..100 {
            assert_eq!(book.pick_address(&exclude).unwrap().id, id(19));
        }

        let all: HashSet<_> = (0..20).map(id).collect();
        assert!(book.pick_address(&all).is_none());
    }

    #[test]
    fn test_pick_address_skips_bad() {
        let book = book(AddrBookConfig::default());
        book.add_address(addr(1), id(500)).unwrap();
        for _ in 0..3 {
            book.mark_attempt_failed(&id(1));
        }
        assert!(book.pick_address(&HashSet::new()).is_none());
    }

    #[test]
    fn test_pick_address_prefers_old() {
        let book = book(AddrBookConfig::default());
        for n in 0..10 {
            book.add_address(addr(n), id(500)).unwrap();
        }
        for n in 0..5 {
            book.mark_good(&id(n));
        }

        let olds = (0..2000)
            .filter_map(|_| book.pick_address(&HashSet::new()))
            .filter(|a| book.get(&a.id).unwrap().is_old())
            .count();
        // 70% weight on old with equal class sizes
        assert!(olds > 1200, "old picked {olds} times");
    }

    #[test]
    fn test_get_selection() {
        let book = book(AddrBookConfig::default());
        for n in 0..100 {
            book.add_address(addr(n), id(500)).unwrap();
        }
        let exclude = HashSet::from([id(0)]);
        let selection = book.get_selection(&exclude, 250);
        // 23% of 100 is below the minimum of 32
        assert_eq!(selection.len(), 32);
        assert!(!selection.iter().any(|a| a.id == id(0)));

        let unique: HashSet<_> = selection.iter().map(|a| a.id).collect();
        assert_eq!(unique.len(), selection.len());

        assert_eq!(book.get_selection(&exclude, 10).len(), 10);
    }

    #[test]
    fn test_mark_bad_bans() {
        let book = book(AddrBookConfig::default());
        book.add_address(addr(1), id(2)).unwrap();
        book.mark_bad(&id(1), Duration::from_secs(60));
        assert!(!book.has(&id(1)));
        assert!(matches!(
            book.add_address(addr(1), id(2)),
            Err(AddrBookError::Banned(_))
        ));

        book.mark_bad(&id(3), Duration::ZERO);
        assert!(book.add_address(addr(3), id(2)).unwrap());
    }

    #[test]
    fn test_expired_bans_are_pruned() {
        let book = book(AddrBookConfig::default());
        for n in 1..=50 {
            book.mark_bad(&id(n), Duration::ZERO);
        }
        book.mark_bad(&id(100), Duration::from_secs(60));

        let state = book.state.lock();
        assert_eq!(state.banned.len(), 1);
        assert!(state.banned.contains_key(&id(100)));
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let config = AddrBookConfig::new(true)
            .with_buckets(4, 5, 2, 5)
            .with_max_addresses(15);
        let book = book(config);
        for n in 0..500 {
            let _ = book.add_address(addr(n), id(10_000 + n % 7));
            if n % 3 == 0 {
                book.mark_good(&id(n));
            }
            assert!(book.size() <= 15);
        }

        let state = book.state.lock();
        let bucketed: usize = state
            .new_buckets
            .iter()
            .chain(state.old_buckets.iter())
            .map(|b| b.len())
            .sum();
        assert_eq!(bucketed, state.addrs.len());
        assert!(state.new_buckets.iter().all(|b| b.len() <= 5));
        assert!(state.old_buckets.iter().all(|b| b.len() <= 5));
    }
}
