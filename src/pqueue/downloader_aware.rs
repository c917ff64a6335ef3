use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::error::Result;
use crate::request::FetchRequest;
use crate::squeue::QueueFactory;
use crate::stats::Stats;
use crate::util::slot_dir_name;

use super::{ActiveSlots, DownloaderActivity, PriorityQueue, PriorityQueueKind, RequestQueue};

/// One priority queue per target host. Pops favour the host whose best
/// request has the highest priority, then the host with the fewest fetches in
/// flight, so a single busy host cannot starve the others.
pub struct DownloaderAwarePriorityQueue {
    factory: Arc<dyn QueueFactory>,
    stats: Arc<Stats>,
    pqueues: HashMap<String, PriorityQueue>,
}

fn host_prefix(host: &str) -> String {
    format!("{}/", slot_dir_name(host))
}

impl DownloaderAwarePriorityQueue {
    pub fn new(factory: Arc<dyn QueueFactory>, stats: Arc<Stats>) -> Self {
        Self {
            factory,
            stats,
            pqueues: HashMap::new(),
        }
    }

    pub fn from_active(
        factory: Arc<dyn QueueFactory>,
        stats: Arc<Stats>,
        slots: &BTreeMap<String, Vec<i32>>,
    ) -> Result<Self> {
        let mut queue = Self::new(factory, stats);
        for (host, priorities) in slots {
            if priorities.is_empty() {
                continue;
            }
            let pq = PriorityQueue::from_active(
                queue.factory.clone(),
                queue.stats.clone(),
                &host_prefix(host),
                priorities,
            )?;
            queue.pqueues.insert(host.clone(), pq);
        }
        Ok(queue)
    }

    /// Hosts that currently hold requests.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.pqueues.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    fn pick(&self, activity: &dyn DownloaderActivity, skip: &HashSet<String>) -> Option<String> {
        self.pqueues
            .iter()
            .filter(|(host, _)| !skip.contains(*host) && activity.is_available(host))
            .filter_map(|(host, pq)| pq.peek_priority().map(|p| (host, p)))
            .min_by(|(ha, pa), (hb, pb)| {
                pb.cmp(pa)
                    .then_with(|| activity.active(ha).cmp(&activity.active(hb)))
                    .then_with(|| ha.cmp(hb))
            })
            .map(|(host, _)| host.clone())
    }
}

impl RequestQueue for DownloaderAwarePriorityQueue {
    fn push(&mut self, request: FetchRequest) -> Result<()> {
        let host = request.host();
        let prefix = host_prefix(&host);
        let (factory, stats) = (&self.factory, &self.stats);
        self.pqueues
            .entry(host)
            .or_insert_with(|| PriorityQueue::with_prefix(factory.clone(), stats.clone(), &prefix))
            .push(request)
    }

    fn pop(&mut self, activity: &dyn DownloaderActivity) -> Option<FetchRequest> {
        // Hosts whose queue reports data but could not be read this time.
        let mut unreadable = HashSet::new();
        loop {
            let host = self.pick(activity, &unreadable)?;
            let pq = self.pqueues.get_mut(&host)?;
            let request = pq.pop_next();
            if pq.is_empty() {
                if let Some(mut pq) = self.pqueues.remove(&host) {
                    if let Err(e) = pq.close_slots() {
                        log::error!("host queue {}: close failed: {}", host, e);
                    }
                }
            }
            if request.is_some() {
                return request;
            }
            log::debug!("host queue {}: nothing readable, trying other hosts", host);
            unreadable.insert(host);
        }
    }

    fn len(&self) -> usize {
        self.pqueues.values().map(|pq| pq.len()).sum()
    }

    fn close(&mut self) -> Result<ActiveSlots> {
        let mut active = ActiveSlots {
            kind: PriorityQueueKind::DownloaderAware,
            ..Default::default()
        };
        let mut first_err = None;
        for (host, mut pq) in std::mem::take(&mut self.pqueues) {
            match pq.close_slots() {
                Ok(priorities) => {
                    if !priorities.is_empty() {
                        active.slots.insert(host, priorities);
                    }
                }
                Err(e) => {
                    log::error!("host queue {}: close failed: {}", host, e);
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
