//! Routing of requests to downstream queues by priority, optionally split by
//! target host.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::request::FetchRequest;
use crate::squeue::QueueFactory;
use crate::stats::Stats;

mod downloader_aware;
mod priority;

pub use downloader_aware::DownloaderAwarePriorityQueue;
pub use priority::PriorityQueue;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriorityQueueKind {
    #[default]
    Default,
    DownloaderAware,
}

/// What the downloader is doing right now, per host slot.
pub trait DownloaderActivity {
    /// Fetches currently in flight for `slot`.
    fn active(&self, slot: &str) -> usize;

    /// Whether a request for `slot` could be dispatched right now. Slots that
    /// are not available keep their requests; they are only skipped.
    fn is_available(&self, _slot: &str) -> bool {
        true
    }
}

impl DownloaderActivity for HashMap<String, usize> {
    fn active(&self, slot: &str) -> usize {
        self.get(slot).copied().unwrap_or(0)
    }
}

/// Activity view for callers that have no downloader.
pub struct Idle;

impl DownloaderActivity for Idle {
    fn active(&self, _slot: &str) -> usize {
        0
    }
}

/// Slots that still held requests at shutdown, so the same downstream queues
/// can be rebuilt on resume. Host slots map to their priorities; the plain
/// priority queue uses the empty host.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSlots {
    pub kind: PriorityQueueKind,
    pub slots: BTreeMap<String, Vec<i32>>,
}

impl ActiveSlots {
    pub fn is_empty(&self) -> bool {
        self.slots.values().all(|p| p.is_empty())
    }
}

pub trait RequestQueue: Send {
    /// Fails only on fatal storage trouble.
    fn push(&mut self, request: FetchRequest) -> Result<()>;

    fn pop(&mut self, activity: &dyn DownloaderActivity) -> Option<FetchRequest>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every downstream queue and report which slots still hold data.
    fn close(&mut self) -> Result<ActiveSlots>;
}

/// Build the configured queue, rebuilding persisted slots when `active` is
/// given.
pub fn build(
    kind: PriorityQueueKind,
    factory: Arc<dyn QueueFactory>,
    stats: Arc<Stats>,
    active: Option<ActiveSlots>,
) -> Result<Box<dyn RequestQueue>> {
    let active = active.unwrap_or_else(|| ActiveSlots {
        kind,
        slots: BTreeMap::new(),
    });
    if active.kind != kind && !active.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "job directory was written by a {:?} priority queue, not {:?}",
            active.kind, kind
        )));
    }
    match kind {
        PriorityQueueKind::Default => {
            let prios = active.slots.get("").cloned().unwrap_or_default();
            Ok(Box::new(PriorityQueue::from_active(factory, stats, "", &prios)?))
        }
        PriorityQueueKind::DownloaderAware => Ok(Box::new(
            DownloaderAwarePriorityQueue::from_active(factory, stats, &active.slots)?,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::squeue::{MemoryQueueFactory, QueueOrder};

    #[test]
    fn test_build_rejects_kind_mismatch() {
        let factory: Arc<dyn QueueFactory> = Arc::new(MemoryQueueFactory::new(QueueOrder::Fifo));
        let mut slots = BTreeMap::new();
        slots.insert("example.com".to_owned(), vec![1]);
        let active = ActiveSlots {
            kind: PriorityQueueKind::DownloaderAware,
            slots,
        };
        let res = build(
            PriorityQueueKind::Default,
            factory,
            Arc::new(Stats::new()),
            Some(active),
        );
        assert!(matches!(res, Err(Error::InvalidConfig(_))));
    }
}
