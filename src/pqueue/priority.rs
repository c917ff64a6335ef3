use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::error::{Component, Error, PushError, QueueError, Result};
use crate::request::FetchRequest;
use crate::squeue::{DownstreamQueue, QueueFactory, QueueOrder};
use crate::stats::Stats;

use super::{ActiveSlots, DownloaderActivity, Idle, PriorityQueueKind, RequestQueue};

/// Most requests a slot sets aside for unavailable hosts. Once reached, the
/// slot yields nothing until one of those hosts frees up, and lower
/// priorities are served meanwhile.
const MAX_PARKED: usize = 256;

/// One priority value: the factory-made queue plus a memory queue for
/// requests the primary refused.
struct Slot {
    key: String,
    order: QueueOrder,
    primary: Box<dyn DownstreamQueue>,
    /// Refused requests, each marked with its place among the primary's
    /// items: for FIFO the primary pop count after which it is due, for LIFO
    /// the primary length at or below which it is due.
    fallback: VecDeque<(u64, FetchRequest)>,
    /// Requests taken from the primary so far.
    popped: u64,
    /// Requests popped while their host was unavailable, oldest first.
    parked: VecDeque<FetchRequest>,
}

impl Slot {
    fn new(key: String, order: QueueOrder, primary: Box<dyn DownstreamQueue>) -> Self {
        Self {
            key,
            order,
            primary,
            fallback: VecDeque::new(),
            popped: 0,
            parked: VecDeque::new(),
        }
    }

    fn len(&self) -> usize {
        self.primary.len() + self.fallback.len() + self.parked.len()
    }

    fn push_fallback(&mut self, request: FetchRequest) {
        let stored = self.primary.len() as u64;
        let mark = match self.order {
            QueueOrder::Fifo => self.popped + stored,
            QueueOrder::Lifo => stored,
        };
        self.fallback.push_back((mark, request));
    }

    /// Next request in push order across the primary and the fallback. A
    /// primary that cannot be read hands over to the fallback early.
    fn pop_stored(&mut self) -> Option<FetchRequest> {
        let fallback_due = match self.order {
            QueueOrder::Fifo => self
                .fallback
                .front()
                .map_or(false, |(mark, _)| *mark <= self.popped),
            QueueOrder::Lifo => self
                .fallback
                .back()
                .map_or(false, |(mark, _)| self.primary.len() as u64 <= *mark),
        };
        if !fallback_due {
            if let Some(request) = self.primary.pop() {
                self.popped += 1;
                return Some(request);
            }
        }
        let item = match self.order {
            QueueOrder::Fifo => self.fallback.pop_front(),
            QueueOrder::Lifo => self.fallback.pop_back(),
        };
        item.map(|(_, request)| request)
    }

    /// Next request whose host is available. Requests for other hosts are
    /// parked, up to `MAX_PARKED`, and served first once their host frees up.
    fn pop(&mut self, activity: &dyn DownloaderActivity) -> Option<FetchRequest> {
        if let Some(i) = self
            .parked
            .iter()
            .position(|request| activity.is_available(&request.host()))
        {
            return self.parked.remove(i);
        }
        while self.parked.len() < MAX_PARKED {
            let request = self.pop_stored()?;
            if activity.is_available(&request.host()) {
                return Some(request);
            }
            self.parked.push_back(request);
        }
        None
    }

    /// Give parked and refused requests another chance at the primary before
    /// it closes, so they survive a restart.
    fn close(&mut self) -> Result<bool> {
        let parked = std::mem::take(&mut self.parked);
        let fallback = std::mem::take(&mut self.fallback);
        let mut lost = 0;
        for request in parked.into_iter().chain(fallback.into_iter().map(|(_, r)| r)) {
            if self.primary.push(request).is_err() {
                lost += 1;
            }
        }
        if lost > 0 {
            log::warn!("queue {}: {} in-memory requests will not survive a restart", self.key, lost);
        }
        let has_data = !self.primary.is_empty();
        self.primary.close()?;
        Ok(has_data)
    }
}

/// Routes each request to the downstream queue of its priority and pops from
/// the highest priority that still has requests.
pub struct PriorityQueue {
    factory: Arc<dyn QueueFactory>,
    stats: Arc<Stats>,
    prefix: String,
    queues: BTreeMap<i32, Slot>,
}

fn slot_key(prefix: &str, priority: i32) -> String {
    format!("{}p{}", prefix, priority)
}

impl PriorityQueue {
    pub fn new(factory: Arc<dyn QueueFactory>, stats: Arc<Stats>) -> Self {
        Self::with_prefix(factory, stats, "")
    }

    /// `prefix` is prepended to every slot key, so several queues can share
    /// one factory.
    pub fn with_prefix(factory: Arc<dyn QueueFactory>, stats: Arc<Stats>, prefix: &str) -> Self {
        Self {
            factory,
            stats,
            prefix: prefix.to_owned(),
            queues: BTreeMap::new(),
        }
    }

    pub fn from_active(
        factory: Arc<dyn QueueFactory>,
        stats: Arc<Stats>,
        prefix: &str,
        priorities: &[i32],
    ) -> Result<Self> {
        let mut pq = Self::with_prefix(factory, stats, prefix);
        for &priority in priorities {
            pq.slot(priority)?;
        }
        Ok(pq)
    }

    fn slot(&mut self, priority: i32) -> Result<&mut Slot> {
        match self.queues.entry(priority) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let key = slot_key(&self.prefix, priority);
                let primary = self.factory.create(&key)?;
                Ok(e.insert(Slot::new(key, self.factory.order(), primary)))
            }
        }
    }

    /// Highest priority with pending requests.
    pub fn peek_priority(&self) -> Option<i32> {
        self.queues
            .iter()
            .rev()
            .find(|(_, slot)| slot.len() > 0)
            .map(|(p, _)| *p)
    }

    pub fn priorities(&self) -> Vec<i32> {
        self.queues.keys().copied().collect()
    }

    /// Pop ignoring downloader activity.
    pub fn pop_next(&mut self) -> Option<FetchRequest> {
        self.pop_available(&Idle)
    }

    fn pop_available(&mut self, activity: &dyn DownloaderActivity) -> Option<FetchRequest> {
        let priorities: Vec<i32> = self.queues.keys().rev().copied().collect();
        for priority in priorities {
            let Some(slot) = self.queues.get_mut(&priority) else {
                continue;
            };
            let request = slot.pop(activity);
            if slot.len() == 0 {
                if let Some(mut slot) = self.queues.remove(&priority) {
                    if let Err(e) = slot.primary.close() {
                        log::error!("queue {}: close failed: {}", slot.key, e);
                    }
                }
            }
            if request.is_some() {
                self.stats.incr_dequeued();
                return request;
            }
            // Nothing available at this priority right now, or a slot that
            // reports data but cannot be read: serve the next priority.
        }
        None
    }

    /// Close all slots; returns the priorities that still hold data.
    pub fn close_slots(&mut self) -> Result<Vec<i32>> {
        let mut active = vec![];
        let mut first_err = None;
        for (priority, mut slot) in std::mem::take(&mut self.queues) {
            match slot.close() {
                Ok(true) => active.push(priority),
                Ok(false) => {}
                Err(e) => {
                    log::error!("queue {}: close failed: {}", slot.key, e);
                    active.push(priority);
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(active),
        }
    }
}

impl RequestQueue for PriorityQueue {
    fn push(&mut self, request: FetchRequest) -> Result<()> {
        let stats = self.stats.clone();
        let slot = self.slot(request.priority)?;
        let PushError { request, kind } = match slot.primary.push(request) {
            Ok(()) => {
                stats.incr_enqueued();
                return Ok(());
            }
            Err(err) => err,
        };
        match kind {
            QueueError::Transient(reason) => {
                stats.incr_transient();
                log::warn!(
                    "queue {}: {}; keeping {} in memory",
                    slot.key,
                    reason,
                    request.url
                );
            }
            QueueError::Serialization(reason) => {
                if stats.incr_unserializable() == 0 {
                    log::warn!(
                        "unable to serialize request {}: {} - keeping it in memory \
                         (further unserializable requests are not logged)",
                        request.url,
                        reason
                    );
                }
            }
            QueueError::Fatal(reason) => {
                return Err(Error::fatal(Component::Queue, slot.key.clone(), reason));
            }
        }
        slot.push_fallback(*request);
        stats.incr_enqueued();
        stats.incr_enqueued_fallback();
        Ok(())
    }

    fn pop(&mut self, activity: &dyn DownloaderActivity) -> Option<FetchRequest> {
        self.pop_available(activity)
    }

    fn len(&self) -> usize {
        self.queues.values().map(Slot::len).sum()
    }

    fn close(&mut self) -> Result<ActiveSlots> {
        let priorities = self.close_slots()?;
        let mut active = ActiveSlots {
            kind: PriorityQueueKind::Default,
            ..Default::default()
        };
        if !priorities.is_empty() {
            active.slots.insert(String::new(), priorities);
        }
        Ok(active)
    }
}
