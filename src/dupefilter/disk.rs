use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;

use crate::error::{Component, Error, Result};
use crate::fingerprint::Fingerprint;
use crate::storage::{KvStore, RocksStore};

use super::DupeFilter;

/// Fingerprint set persisted in a key/value store, keyed by the raw
/// fingerprint with the first-seen timestamp as value.
///
/// A failed write does not stop the crawl: the filter logs it and keeps
/// working from memory for the rest of its life.
pub struct DiskDupeFilter<S: KvStore = RocksStore> {
    recent: HashSet<Fingerprint>,
    store: Option<S>,
    writable: bool,
}

impl DiskDupeFilter<RocksStore> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let store = RocksStore::open(path)
            .map_err(|e| Error::fatal(Component::DupeFilter, path.display().to_string(), e))?;
        Ok(Self::with_store(store))
    }
}

impl<S: KvStore> DiskDupeFilter<S> {
    pub fn with_store(store: S) -> Self {
        Self {
            recent: HashSet::new(),
            store: Some(store),
            writable: true,
        }
    }

    /// Whether fingerprints are still being persisted.
    pub fn is_persisting(&self) -> bool {
        self.writable && self.store.is_some()
    }
}

impl<S: KvStore> DupeFilter for DiskDupeFilter<S> {
    fn seen(&self, fp: &Fingerprint) -> bool {
        if self.recent.contains(fp) {
            return true;
        }
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        match store.get(fp.as_bytes()) {
            Ok(found) => found.is_some(),
            Err(e) => {
                log::warn!("dupefilter: lookup of {} failed: {}", fp, e);
                false
            }
        }
    }

    fn add(&mut self, fp: Fingerprint) {
        if self.writable {
            if let Some(store) = self.store.as_ref() {
                let seen_at = Utc::now().timestamp().to_be_bytes();
                if let Err(e) = store.put(fp.as_bytes(), &seen_at) {
                    log::error!(
                        "dupefilter: cannot persist fingerprints ({}), continuing in memory only",
                        e
                    );
                    self.writable = false;
                }
            }
        }
        self.recent.insert(fp);
    }

    fn close(&mut self) -> Result<()> {
        let Some(store) = self.store.take() else {
            return Ok(());
        };
        if !self.writable {
            return Ok(());
        }
        store
            .flush()
            .map_err(|e| Error::fatal(Component::DupeFilter, "requests.seen", e))
    }
}
