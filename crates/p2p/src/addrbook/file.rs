//! JSON persistence with atomic writes.

use super::{AddrBookError, AddressBook, BookState, BucketType, KnownAddress};
use alloy_primitives::B256;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, ErrorKind},
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Serialize)]
struct BookFileRef<'a> {
    key: B256,
    addrs: Vec<&'a KnownAddress>,
}

/// Lenient shape used for reading; entries are decoded one by one.
#[derive(Deserialize)]
struct BookFileRaw {
    #[serde(default)]
    key: serde_json::Value,
    #[serde(default)]
    addrs: Vec<serde_json::Value>,
}

impl AddressBook {
    /// Replace the in-memory state with the contents of the book file.
    ///
    /// A missing file leaves the book empty. A file that cannot be parsed is an
    /// error in strict mode; otherwise unreadable parts are discarded. Returns
    /// the number of entries restored.
    pub fn load(&self) -> Result<usize, AddrBookError> {
        let strict = self.config.strict;
        let corrupt = |reason: String| AddrBookError::Corrupt {
            path: self.path.clone(),
            reason,
        };

        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No address book file, starting empty");
                return Ok(0);
            }
            Err(source) => {
                return Err(AddrBookError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let raw: BookFileRaw = match serde_json::from_reader(BufReader::new(file)) {
            Ok(raw) => raw,
            Err(e) if strict => return Err(corrupt(e.to_string())),
            Err(e) => {
                warn!(path = %self.path.display(), err = %e, "Discarding unreadable address book");
                return Ok(0);
            }
        };

        let key = match serde_json::from_value::<B256>(raw.key) {
            Ok(key) => key,
            Err(e) if strict => return Err(corrupt(format!("invalid key: {e}"))),
            Err(e) => {
                warn!(err = %e, "Invalid address book key, generating a new one");
                B256::random()
            }
        };

        let mut entries = Vec::with_capacity(raw.addrs.len());
        for (index, value) in raw.addrs.into_iter().enumerate() {
            match serde_json::from_value::<KnownAddress>(value) {
                Ok(known) => entries.push(known),
                Err(e) if strict => return Err(corrupt(format!("entry {index}: {e}"))),
                Err(e) => warn!(index, err = %e, "Discarding unreadable address book entry"),
            }
        }

        let mut state = BookState::new(key, &self.config);
        for known in entries {
            if self.is_our_id(&known.addr.id) || !known.addr.is_valid() {
                continue;
            }
            if self.config.strict && !known.addr.is_routable() {
                debug!(addr = %known.addr, "Skipping non-routable stored address");
                continue;
            }
            // duplicated ids: the later entry wins
            state.remove(&known.addr.id);
            match known.bucket_type {
                BucketType::New => state.insert_new(known, &self.config),
                BucketType::Old => state.insert_old(known, &self.config),
            }
        }

        let restored = state.addrs.len();
        *self.state.lock() = state;
        info!(path = %self.path.display(), addrs = restored, "Loaded address book");
        Ok(restored)
    }

    /// Write the full bucket state to disk.
    ///
    /// The snapshot is taken under the book lock; the file is written to a
    /// temporary path, synced and renamed into place.
    pub fn save(&self) -> Result<(), AddrBookError> {
        let io_err = |source| AddrBookError::Io {
            path: self.path.clone(),
            source,
        };

        let _guard = self.save_lock.lock();
        let (key, entries) = {
            let state = self.state.lock();
            (state.key, state.addrs.values().cloned().collect::<Vec<_>>())
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let file = File::create(&tmp_path).map_err(io_err)?;
            let mut writer = BufWriter::new(file);
            let contents = BookFileRef {
                key,
                addrs: entries.iter().collect(),
            };
            serde_json::to_writer_pretty(&mut writer, &contents)
                .map_err(|e| io_err(std::io::Error::new(ErrorKind::Other, e)))?;
            let file = writer.into_inner().map_err(|e| io_err(e.into_error()))?;
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp_path, &self.path).map_err(io_err)?;

        debug!(path = %self.path.display(), addrs = entries.len(), "Saved address book");
        Ok(())
    }

    /// Flush the book every `interval` until cancelled.
    pub async fn run_save_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.save() {
                        error!(err = %e, "Failed to save address book");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{addrbook::AddrBookConfig, address::NodeAddress};
    use alloy_primitives::B512;
    use reth_network_peers::PeerId;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn id(n: u8) -> PeerId {
        B512::repeat_byte(n)
    }

    fn addr(n: u8) -> NodeAddress {
        NodeAddress::new(id(n), format!("8.8.4.{n}:26656").parse().unwrap())
    }

    fn sorted(book: &AddressBook) -> Vec<KnownAddress> {
        let mut entries = book.entries();
        entries.sort_by_key(|k| k.id());
        entries
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("addrbook.json");
        let book = AddressBook::new(path, AddrBookConfig::default());
        assert_eq!(book.load().unwrap(), 0);
        assert!(book.is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("addrbook.json");

        let book = AddressBook::new(&path, AddrBookConfig::default());
        for n in 1..=20 {
            book.add_address(addr(n), id(100 + n)).unwrap();
        }
        for n in 1..=5 {
            book.mark_good(&id(n));
        }
        book.mark_attempt_failed(&id(10));
        book.mark_attempt_failed(&id(10));
        book.save().unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let restored = AddressBook::new(&path, AddrBookConfig::default());
        assert_eq!(restored.load().unwrap(), 20);
        assert_eq!(sorted(&restored), sorted(&book));
        assert_eq!(restored.class_sizes(), (15, 5));
        assert_eq!(restored.get(&id(10)).unwrap().attempts, 2);
        assert_eq!(restored.state.lock().key, book.state.lock().key);

        // buckets are recomputed identically from the persisted key
        let buckets = |book: &AddressBook| -> HashSet<_> {
            book.entries().iter().map(|k| (k.id(), k.bucket)).collect()
        };
        assert_eq!(buckets(&book), buckets(&restored));
    }

    #[test]
    fn test_corrupt_file_strict_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("addrbook.json");
        fs::write(&path, "{ this is not json").unwrap();

        let book = AddressBook::new(&path, AddrBookConfig::new(true));
        assert!(matches!(book.load(), Err(AddrBookError::Corrupt { .. })));

        let lax = AddressBook::new(&path, AddrBookConfig::new(false));
        assert_eq!(lax.load().unwrap(), 0);
        assert!(lax.is_empty());
    }

    #[test]
    fn test_unreadable_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("addrbook.json");

        let book = AddressBook::new(&path, AddrBookConfig::new(false));
        book.add_address(addr(1), id(50)).unwrap();
        book.add_address(addr(2), id(50)).unwrap();
        book.save().unwrap();

        let mut json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        json["addrs"]
            .as_array_mut()
            .unwrap()
            .push(serde_json::json!({ "addr": "garbage" }));
        fs::write(&path, serde_json::to_string(&json).unwrap()).unwrap();

        let lax = AddressBook::new(&path, AddrBookConfig::new(false));
        assert_eq!(lax.load().unwrap(), 2);

        let strict = AddressBook::new(&path, AddrBookConfig::new(true));
        assert!(matches!(strict.load(), Err(AddrBookError::Corrupt { .. })));
    }

    #[test]
    fn test_missing_key_keeps_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("addrbook.json");

        let book = AddressBook::new(&path, AddrBookConfig::new(false));
        book.add_address(addr(1), id(50)).unwrap();
        book.add_address(addr(2), id(50)).unwrap();
        book.save().unwrap();

        let mut json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        json.as_object_mut().unwrap().remove("key");
        fs::write(&path, serde_json::to_string(&json).unwrap()).unwrap();

        let lax = AddressBook::new(&path, AddrBookConfig::new(false));
        assert_eq!(lax.load().unwrap(), 2);
        assert_ne!(lax.state.lock().key, book.state.lock().key);

        let strict = AddressBook::new(&path, AddrBookConfig::new(true));
        assert!(matches!(strict.load(), Err(AddrBookError::Corrupt { .. })));
    }

    #[test]
    fn test_own_id_is_dropped_on_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("addrbook.json");

        let book = AddressBook::new(&path, AddrBookConfig::default());
        book.add_address(addr(1), id(50)).unwrap();
        book.add_address(addr(2), id(50)).unwrap();
        book.save().unwrap();

        let restored = AddressBook::new(&path, AddrBookConfig::default());
        restored.add_our_id(id(1));
        assert_eq!(restored.load().unwrap(), 1);
        assert!(!restored.has(&id(1)));
        assert!(restored.has(&id(2)));
    }

    #[test]
    fn test_save_replaces_previous_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("addrbook.json");

        let book = AddressBook::new(&path, AddrBookConfig::default());
        book.add_address(addr(1), id(50)).unwrap();
        book.save().unwrap();
        book.add_address(addr(2), id(50)).unwrap();
        book.save().unwrap();

        assert!(!path.with_extension("json.tmp").exists());
        let restored = AddressBook::new(&path, AddrBookConfig::default());
        assert_eq!(restored.load().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_save_loop_stops_on_cancel() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("addrbook.json");
        let book = Arc::new(AddressBook::new(&path, AddrBookConfig::default()));
        book.add_address(addr(1), id(2)).unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            Arc::clone(&book).run_save_loop(Duration::from_millis(20), cancel.clone()),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(path.exists());

        cancel.cancel();
        task.await.unwrap();
    }
}
