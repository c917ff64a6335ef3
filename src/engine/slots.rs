use std::collections::HashMap;

use tokio::time::Instant;

use crate::pqueue::DownloaderActivity;
use crate::throttle::AutoThrottle;

/// In-flight fetch counters, globally and per host.
pub(crate) struct Slots {
    global_limit: usize,
    /// 0 means no per-host limit.
    host_limit: usize,
    active: HashMap<String, usize>,
    total: usize,
}

impl Slots {
    pub fn new(global_limit: usize, host_limit: usize) -> Self {
        Self {
            global_limit,
            host_limit,
            active: HashMap::new(),
            total: 0,
        }
    }

    pub fn acquire(&mut self, host: &str) {
        *self.active.entry(host.to_owned()).or_insert(0) += 1;
        self.total += 1;
    }

    pub fn release(&mut self, host: &str) {
        if let Some(n) = self.active.get_mut(host) {
            *n -= 1;
            if *n == 0 {
                self.active.remove(host);
            }
            self.total -= 1;
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn has_capacity(&self) -> bool {
        self.total < self.global_limit
    }

    pub fn host_has_capacity(&self, host: &str) -> bool {
        self.host_limit == 0 || self.active_for(host) < self.host_limit
    }

    pub fn active_for(&self, host: &str) -> usize {
        self.active.get(host).copied().unwrap_or(0)
    }
}

/// What the dispatcher can do right now: a host is available when it has
/// spare concurrency and its throttle delay has elapsed.
pub(crate) struct Availability<'a> {
    pub slots: &'a Slots,
    pub throttle: &'a AutoThrottle,
    pub now: Instant,
}

impl DownloaderActivity for Availability<'_> {
    fn active(&self, slot: &str) -> usize {
        self.slots.active_for(slot)
    }

    fn is_available(&self, slot: &str) -> bool {
        self.slots.host_has_capacity(slot) && self.throttle.is_eligible(slot, self.now)
    }
}

/// Dispatch bookkeeping: in-flight counters and per-host pacing. The engine
/// shares it with the blocking pool while the scheduler pops.
pub(crate) struct Gate {
    pub slots: Slots,
    pub throttle: AutoThrottle,
}

impl Gate {
    pub fn availability(&self, now: Instant) -> Availability<'_> {
        Availability {
            slots: &self.slots,
            throttle: &self.throttle,
            now,
        }
    }

    pub fn is_available(&self, host: &str, now: Instant) -> bool {
        self.availability(now).is_available(host)
    }

    /// Take a fetch slot for `host` and start its delay.
    pub fn reserve(&mut self, host: &str, now: Instant) {
        self.slots.acquire(host);
        self.throttle.on_dispatch(host, now);
    }
}
