//! Downstream queues: the ordered storage behind one priority (or host)
//! slot.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{PushError, Result};
use crate::request::FetchRequest;

mod disk;
mod memory;

pub use disk::DiskQueue;
pub use memory::MemoryQueue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueOrder {
    Fifo,
    Lifo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueKind {
    MemoryFifo,
    MemoryLifo,
    DiskFifo,
    DiskLifo,
}

impl QueueKind {
    pub fn order(self) -> QueueOrder {
        match self {
            QueueKind::MemoryFifo | QueueKind::DiskFifo => QueueOrder::Fifo,
            QueueKind::MemoryLifo | QueueKind::DiskLifo => QueueOrder::Lifo,
        }
    }

    pub fn is_disk(self) -> bool {
        matches!(self, QueueKind::DiskFifo | QueueKind::DiskLifo)
    }
}

/// Ordered container for the pending requests of a single slot.
///
/// `len()` must never report 0 while requests remain: callers treat an empty
/// queue as safe to close, and closing an empty disk queue deletes it.
pub trait DownstreamQueue: Send {
    /// A `Transient` or `Serialization` error hands the request back for the
    /// caller's fallback; `Fatal` stops the crawl.
    fn push(&mut self, request: FetchRequest) -> std::result::Result<(), PushError>;

    /// `None` either when empty or on transient trouble reading.
    fn pop(&mut self) -> Option<FetchRequest>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release resources. Must be idempotent.
    fn close(&mut self) -> Result<()>;
}

/// Builds the downstream queue for a slot key. The key identifies the queue
/// across restarts, so the same key must reach the same persisted data.
pub trait QueueFactory: Send + Sync {
    fn create(&self, key: &str) -> Result<Box<dyn DownstreamQueue>>;

    /// Ordering of the queues this factory creates. The in-memory fallback
    /// for a slot follows it too.
    fn order(&self) -> QueueOrder;

    fn is_persistent(&self) -> bool {
        false
    }
}

pub struct MemoryQueueFactory {
    order: QueueOrder,
}

impl MemoryQueueFactory {
    pub fn new(order: QueueOrder) -> Self {
        Self { order }
    }
}

impl QueueFactory for MemoryQueueFactory {
    fn create(&self, _key: &str) -> Result<Box<dyn DownstreamQueue>> {
        Ok(Box::new(MemoryQueue::new(self.order)))
    }

    fn order(&self) -> QueueOrder {
        self.order
    }
}

/// One rocksdb-backed queue per slot, under `root/<key>`.
pub struct DiskQueueFactory {
    root: PathBuf,
    order: QueueOrder,
}

impl DiskQueueFactory {
    pub fn new(root: impl Into<PathBuf>, order: QueueOrder) -> Self {
        Self {
            root: root.into(),
            order,
        }
    }
}

impl QueueFactory for DiskQueueFactory {
    fn create(&self, key: &str) -> Result<Box<dyn DownstreamQueue>> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Box::new(DiskQueue::open(path, key, self.order)?))
    }

    fn order(&self) -> QueueOrder {
        self.order
    }

    fn is_persistent(&self) -> bool {
        true
    }
}

/// Pick the factory for a queue kind. Disk kinds need a directory.
pub fn factory_for(kind: QueueKind, root: Option<PathBuf>) -> Result<Arc<dyn QueueFactory>> {
    match (kind.is_disk(), root) {
        (true, Some(root)) => Ok(Arc::new(DiskQueueFactory::new(root, kind.order()))),
        (true, None) => Err(crate::Error::InvalidConfig(format!(
            "{:?} requires a job directory",
            kind
        ))),
        (false, _) => Ok(Arc::new(MemoryQueueFactory::new(kind.order()))),
    }
}
