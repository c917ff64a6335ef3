use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{NaiveDateTime, Utc};

#[derive(Debug)]
pub struct Stats {
    // downloader
    total_crawled: AtomicU64,
    total_exceptions: AtomicU64,
    // spider output
    total_processed: AtomicU64,
    // scheduler
    enqueued: AtomicU64,
    enqueued_fallback: AtomicU64,
    dequeued: AtomicU64,
    unserializable: AtomicU64,
    transient: AtomicU64,
    filtered: AtomicU64,
    // engine
    held: AtomicU64,
    start_time: Mutex<NaiveDateTime>,
}

/// Point-in-time copy of the counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub crawled: u64,
    pub exceptions: u64,
    pub processed: u64,
    pub enqueued: u64,
    pub enqueued_fallback: u64,
    pub dequeued: u64,
    pub unserializable: u64,
    pub transient: u64,
    pub filtered: u64,
    pub held: u64,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed)
}

impl Stats {
    pub fn new() -> Self {
        Self {
            total_crawled: AtomicU64::new(0),
            total_exceptions: AtomicU64::new(0),
            total_processed: AtomicU64::new(0),
            enqueued: AtomicU64::new(0),
            enqueued_fallback: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            unserializable: AtomicU64::new(0),
            transient: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            held: AtomicU64::new(0),
            start_time: Mutex::new(Utc::now().naive_utc()),
        }
    }

    pub fn incr_total_crawled(&self) {
        bump(&self.total_crawled);
    }

    pub fn incr_exceptions(&self) {
        bump(&self.total_exceptions);
    }

    pub fn add_total_processed(&self, value: u64) {
        self.total_processed.fetch_add(value, Ordering::Relaxed);
    }

    pub fn incr_enqueued(&self) {
        bump(&self.enqueued);
    }

    pub fn incr_enqueued_fallback(&self) {
        bump(&self.enqueued_fallback);
    }

    pub fn incr_dequeued(&self) {
        bump(&self.dequeued);
    }

    /// Returns the previous count so callers can log only the first one.
    pub fn incr_unserializable(&self) -> u64 {
        bump(&self.unserializable)
    }

    pub fn incr_transient(&self) {
        bump(&self.transient);
    }

    /// Returns the previous count so callers can log only the first one.
    pub fn incr_filtered(&self) -> u64 {
        bump(&self.filtered)
    }

    pub fn incr_held(&self) {
        bump(&self.held);
    }

    pub fn total_crawled(&self) -> u64 {
        self.total_crawled.load(Ordering::Relaxed)
    }

    pub fn total_processed(&self) -> u64 {
        self.total_processed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            crawled: get(&self.total_crawled),
            exceptions: get(&self.total_exceptions),
            processed: get(&self.total_processed),
            enqueued: get(&self.enqueued),
            enqueued_fallback: get(&self.enqueued_fallback),
            dequeued: get(&self.dequeued),
            unserializable: get(&self.unserializable),
            transient: get(&self.transient),
            filtered: get(&self.filtered),
            held: get(&self.held),
        }
    }

    pub fn crawled_per_minute(&self) -> u64 {
        let crawled = self.total_crawled();
        let elapsed = (self.elapsed_time() / 60) as u64;
        if elapsed > 0 {
            crawled / elapsed
        } else {
            0
        }
    }

    pub fn processed_per_minute(&self) -> u64 {
        let processed = self.total_processed();
        let elapsed = (self.elapsed_time() / 60) as u64;
        if elapsed > 0 {
            processed / elapsed
        } else {
            0
        }
    }

    /// Elapsed time since the crawl started in seconds
    pub fn elapsed_time(&self) -> i64 {
        let start_time = match self.start_time.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        let now = Utc::now().naive_utc();
        (now - start_time).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_only_counters() {
        let stats = Stats::new();
        assert_eq!(stats.incr_filtered(), 0);
        assert_eq!(stats.incr_filtered(), 1);
        assert_eq!(stats.incr_unserializable(), 0);
        stats.incr_enqueued();
        stats.add_total_processed(3);

        let snap = stats.snapshot();
        assert_eq!(snap.filtered, 2);
        assert_eq!(snap.unserializable, 1);
        assert_eq!(snap.enqueued, 1);
        assert_eq!(snap.processed, 3);
        assert_eq!(stats.crawled_per_minute(), 0);
    }
}
