use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Component, Error, PushError, QueueError, Result};
use crate::request::FetchRequest;
use crate::storage::{KvStore, RocksStore};

use super::{DownstreamQueue, QueueOrder};

const META_KEY: &[u8] = b"meta";

/// Live items occupy sequence numbers `head..tail`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Bounds {
    head: u64,
    tail: u64,
}

impl Bounds {
    fn len(&self) -> u64 {
        self.tail.saturating_sub(self.head)
    }
}

fn item_key(seq: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = b'i';
    key[1..].copy_from_slice(&seq.to_be_bytes());
    key
}

fn read_bounds<S: KvStore>(store: &S) -> io::Result<Bounds> {
    match store.get(META_KEY)? {
        Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
        None => Ok(Bounds::default()),
    }
}

fn write_bounds<S: KvStore>(store: &S, bounds: Bounds) -> io::Result<()> {
    let bytes = serde_json::to_vec(&bounds)?;
    store.put(META_KEY, &bytes)
}

/// Serializes each request as JSON into a key/value store, one key per
/// sequence number.
///
/// The persisted bounds are the source of truth for the length; the copy kept
/// here is what gets reported when the store cannot be read.
pub struct DiskQueue<S: KvStore = RocksStore> {
    key: String,
    order: QueueOrder,
    store: Option<S>,
    bounds: Bounds,
}

impl DiskQueue<RocksStore> {
    pub fn open(path: impl AsRef<Path>, key: &str, order: QueueOrder) -> Result<Self> {
        let store = RocksStore::open(path).map_err(|e| Error::fatal(Component::Queue, key, e))?;
        Self::with_store(store, key, order)
    }
}

impl<S: KvStore> DiskQueue<S> {
    pub fn with_store(store: S, key: &str, order: QueueOrder) -> Result<Self> {
        let bounds = read_bounds(&store)
            .map_err(|e| Error::fatal(Component::Queue, key, format!("unreadable queue metadata: {}", e)))?;
        if bounds.len() > 0 {
            log::debug!("queue {}: resuming with {} requests", key, bounds.len());
        }
        Ok(Self {
            key: key.to_owned(),
            order,
            store: Some(store),
            bounds,
        })
    }
}

impl<S: KvStore> DownstreamQueue for DiskQueue<S> {
    fn push(&mut self, request: FetchRequest) -> std::result::Result<(), PushError> {
        let Some(store) = self.store.as_ref() else {
            let reason = format!("queue {} is closed", self.key);
            return Err(PushError::new(request, QueueError::Fatal(reason)));
        };
        if request.attachment.is_some() {
            let reason = "request carries an in-process attachment".to_owned();
            return Err(PushError::new(request, QueueError::Serialization(reason)));
        }
        let bytes = match serde_json::to_vec(&request) {
            Ok(bytes) => bytes,
            Err(e) => return Err(PushError::new(request, QueueError::Serialization(e.to_string()))),
        };

        let seq = self.bounds.tail;
        let next = Bounds {
            tail: seq + 1,
            ..self.bounds
        };
        if let Err(e) = store.put(&item_key(seq), &bytes) {
            return Err(PushError::new(request, QueueError::Transient(e.to_string())));
        }
        if let Err(e) = write_bounds(store, next) {
            // The item is outside the persisted bounds; remove it if we can.
            let _ = store.delete(&item_key(seq));
            return Err(PushError::new(request, QueueError::Transient(e.to_string())));
        }
        self.bounds = next;
        Ok(())
    }

    fn pop(&mut self) -> Option<FetchRequest> {
        let store = self.store.as_ref()?;
        while self.bounds.len() > 0 {
            let (seq, next) = match self.order {
                QueueOrder::Fifo => {
                    let seq = self.bounds.head;
                    (seq, Bounds { head: seq + 1, ..self.bounds })
                }
                QueueOrder::Lifo => {
                    let seq = self.bounds.tail - 1;
                    (seq, Bounds { tail: seq, ..self.bounds })
                }
            };

            let bytes = match store.get(&item_key(seq)) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("queue {}: read of item {} failed: {}", self.key, seq, e);
                    return None;
                }
            };
            if let Err(e) = write_bounds(store, next) {
                log::warn!("queue {}: cannot advance past item {}: {}", self.key, seq, e);
                return None;
            }
            self.bounds = next;

            let Some(bytes) = bytes else {
                continue;
            };
            if let Err(e) = store.delete(&item_key(seq)) {
                log::warn!("queue {}: leaving consumed item {} behind: {}", self.key, seq, e);
            }
            match serde_json::from_slice::<FetchRequest>(&bytes) {
                Ok(request) => return Some(request),
                Err(e) => log::error!("queue {}: dropping undecodable item {}: {}", self.key, seq, e),
            }
        }
        None
    }

    fn len(&self) -> usize {
        let Some(store) = self.store.as_ref() else {
            return 0;
        };
        match read_bounds(store) {
            Ok(bounds) => bounds.len() as usize,
            Err(e) => {
                let estimate = self.bounds.len().max(1) as usize;
                log::warn!(
                    "queue {}: cannot read length ({}), reporting {}",
                    self.key,
                    e,
                    estimate
                );
                estimate
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        let Some(store) = self.store.take() else {
            return Ok(());
        };
        if self.bounds.len() == 0 {
            if let Err(e) = store.destroy() {
                log::warn!("queue {}: cannot remove empty queue: {}", self.key, e);
            }
            return Ok(());
        }
        store
            .flush()
            .map_err(|e| Error::fatal(Component::Queue, self.key.clone(), e))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::testing::FaultyStore;

    fn urls(q: &mut dyn DownstreamQueue) -> Vec<String> {
        std::iter::from_fn(|| q.pop()).map(|r| r.url).collect()
    }

    #[test]
    fn test_order_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        for (order, expected) in [
            (QueueOrder::Fifo, vec!["a", "b", "c"]),
            (QueueOrder::Lifo, vec!["c", "b", "a"]),
        ] {
            let path = dir.path().join(format!("{:?}", order));
            {
                let mut q = DiskQueue::open(&path, "q", order).unwrap();
                for url in ["a", "b", "c"] {
                    q.push(FetchRequest::new(url).with_priority(3)).unwrap();
                }
                q.close().unwrap();
            }
            let mut q = DiskQueue::open(&path, "q", order).unwrap();
            assert_eq!(q.len(), 3);
            assert_eq!(urls(&mut q), expected);
            assert_eq!(q.len(), 0);
            q.close().unwrap();
            assert!(!path.exists());
        }
    }

    #[test]
    fn test_attachment_is_a_serialization_error() {
        let mut q = DiskQueue::with_store(FaultyStore::default(), "q", QueueOrder::Fifo).unwrap();
        let req = FetchRequest::new("a").with_attachment(Arc::new(()));
        let err = q.push(req).unwrap_err();
        assert!(matches!(err.kind, QueueError::Serialization(_)));
        assert_eq!(err.into_request().url, "a");
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_write_fault_is_transient() {
        let store = FaultyStore::default();
        let mut q = DiskQueue::with_store(store.clone(), "q", QueueOrder::Fifo).unwrap();
        q.push(FetchRequest::new("a")).unwrap();
        store.set_fail_writes(true);
        let err = q.push(FetchRequest::new("b")).unwrap_err();
        assert!(matches!(err.kind, QueueError::Transient(_)));
        store.set_fail_writes(false);
        assert_eq!(q.len(), 1);
        assert_eq!(urls(&mut q), vec!["a"]);
    }

    #[test]
    fn test_len_is_not_zero_under_read_fault() {
        let store = FaultyStore::default();
        let mut q = DiskQueue::with_store(store.clone(), "q", QueueOrder::Lifo).unwrap();
        q.push(FetchRequest::new("a")).unwrap();
        q.push(FetchRequest::new("b")).unwrap();

        store.set_fail_reads(true);
        assert_eq!(q.len(), 2);
        assert!(q.pop().is_none());
        assert!(q.len() > 0);

        store.set_fail_reads(false);
        assert_eq!(urls(&mut q), vec!["b", "a"]);
    }

    #[test]
    fn test_corrupt_metadata_is_fatal() {
        let store = FaultyStore::default();
        store.put(META_KEY, b"not json").unwrap();
        match DiskQueue::with_store(store, "p5", QueueOrder::Fifo) {
            Err(Error::Fatal { component, key, .. }) => {
                assert_eq!(component, Component::Queue);
                assert_eq!(key, "p5");
            }
            _ => panic!("expected a fatal error"),
        }
    }

    #[test]
    fn test_close_is_idempotent_and_rejects_pushes() {
        let mut q = DiskQueue::with_store(FaultyStore::default(), "q", QueueOrder::Fifo).unwrap();
        q.push(FetchRequest::new("a")).unwrap();
        q.close().unwrap();
        q.close().unwrap();
        let err = q.push(FetchRequest::new("b")).unwrap_err();
        assert!(matches!(err.kind, QueueError::Fatal(_)));
    }
}
