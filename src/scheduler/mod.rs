//! Admission side of the crawl: fingerprint, filter, queue.

use std::sync::Arc;

use crate::config::Config;
use crate::dupefilter::{DiskDupeFilter, DupeFilter, DupeFilterKind, MemoryDupeFilter};
use crate::error::{Component, Error, Result};
use crate::fingerprint::Fingerprinter;
use crate::jobdir::JobDir;
use crate::pqueue::{self, DownloaderActivity, RequestQueue};
use crate::request::FetchRequest;
use crate::signals::{Signal, Signals};
use crate::squeue;
use crate::stats::Stats;

pub trait Scheduler {
    /// Admit a request unless it is a duplicate.
    ///
    /// Returns whether the request was enqueued. An `Err` is fatal to the
    /// crawl.
    fn enqueue_request(&mut self, request: FetchRequest) -> Result<bool>;

    /// Put back a request that was popped but could not be dispatched. It
    /// skips the dupefilter, having passed it once already.
    fn requeue_request(&mut self, request: FetchRequest) -> Result<()>;

    /// Next request to hand to the downloader, skipping hosts `activity`
    /// marks unavailable.
    fn next_request(&mut self, activity: &dyn DownloaderActivity) -> Option<FetchRequest>;

    /// Returns the number of requests enqueued in the scheduler.
    fn len(&self) -> usize;

    fn has_pending_requests(&self) -> bool {
        self.len() > 0
    }

    /// Persist what is left and release storage. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// The scheduler proper: one fingerprinter, one dupefilter, one priority
/// queue and an optional job directory.
///
/// It is not internally synchronized. The engine owns it from a single task,
/// which keeps every check-then-insert on the dupefilter atomic.
pub struct CoreScheduler {
    fingerprinter: Arc<dyn Fingerprinter>,
    dupefilter: Box<dyn DupeFilter>,
    queue: Box<dyn RequestQueue>,
    jobdir: Option<JobDir>,
    signals: Arc<Signals>,
    stats: Arc<Stats>,
    dupefilter_debug: bool,
    persistent: bool,
    closed: bool,
}

impl CoreScheduler {
    /// Build the configured queue and dupefilter. A job directory that already
    /// holds state resumes the crawl from it.
    pub fn open(
        config: &Config,
        fingerprinter: Arc<dyn Fingerprinter>,
        signals: Arc<Signals>,
        stats: Arc<Stats>,
    ) -> Result<Self> {
        config.sanity_check()?;

        let jobdir = config.job_dir.as_ref().map(JobDir::open).transpose()?;
        let factory = squeue::factory_for(
            config.effective_queue_kind(),
            jobdir.as_ref().map(JobDir::queue_dir),
        )?;
        let persistent = factory.is_persistent();
        let active = match &jobdir {
            Some(jobdir) => jobdir.load_active()?,
            None => None,
        };
        let queue = pqueue::build(config.priority_queue, factory, stats.clone(), active)?;

        let dupefilter: Box<dyn DupeFilter> = match (config.dupefilter, &jobdir) {
            (DupeFilterKind::Memory, _) => Box::new(MemoryDupeFilter::new()),
            (DupeFilterKind::Disk, Some(jobdir)) => Box::new(DiskDupeFilter::open(jobdir.seen_path())?),
            (DupeFilterKind::Disk, None) => {
                return Err(Error::InvalidConfig("dupefilter = disk requires a job_dir".to_owned()))
            }
        };

        let resumed = jobdir.as_ref().map_or(false, JobDir::is_resuming);
        let pending = queue.len();
        if let Some(jobdir) = jobdir.as_ref().filter(|j| j.is_resuming()) {
            log::info!(
                "Resuming crawl from {} ({} requests scheduled)",
                jobdir.root().display(),
                pending
            );
        }
        signals.emit(Signal::SchedulerOpened { resumed, pending });

        Ok(Self {
            fingerprinter,
            dupefilter,
            queue,
            jobdir,
            signals,
            stats,
            dupefilter_debug: config.dupefilter_debug,
            persistent,
            closed: false,
        })
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    fn log_filtered(&self, request: &FetchRequest) {
        let previous = self.stats.incr_filtered();
        if self.dupefilter_debug {
            log::debug!("Filtered duplicate request: {}", request.url);
        } else if previous == 0 {
            log::debug!(
                "Filtered duplicate request: {} - no more duplicates will be shown \
                 (set dupefilter_debug to show all duplicates)",
                request.url
            );
        }
    }
}

impl Scheduler for CoreScheduler {
    fn enqueue_request(&mut self, request: FetchRequest) -> Result<bool> {
        if !request.dont_filter {
            let fp = request
                .fingerprint(self.fingerprinter.as_ref())
                .map_err(|e| match e {
                    e @ Error::Fatal { .. } => e,
                    e => Error::fatal(Component::Fingerprinter, &request.url, e),
                })?;
            if self.dupefilter.request_seen(&fp) {
                self.log_filtered(&request);
                self.signals.emit(Signal::RequestDropped(&request));
                return Ok(false);
            }
        }
        self.signals.emit(Signal::RequestScheduled(&request));
        self.queue.push(request)?;
        Ok(true)
    }

    fn requeue_request(&mut self, request: FetchRequest) -> Result<()> {
        self.queue.push(request)
    }

    fn next_request(&mut self, activity: &dyn DownloaderActivity) -> Option<FetchRequest> {
        self.queue.pop(activity)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let pending = self.queue.len();
        if pending > 0 && !self.persistent {
            log::warn!("Discarding {} scheduled requests (no job directory)", pending);
        }
        let queue_res = self.queue.close();
        let filter_res = self.dupefilter.close();
        self.signals.emit(Signal::SchedulerClosed { pending });

        let active = queue_res?;
        if let Some(jobdir) = &self.jobdir {
            jobdir.save_active(&active)?;
        }
        filter_res
    }
}

impl Drop for CoreScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("scheduler close failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::fingerprint::{DefaultFingerprinter, Fingerprint};
    use crate::pqueue::Idle;

    fn open(config: &Config) -> CoreScheduler {
        CoreScheduler::open(
            config,
            Arc::new(DefaultFingerprinter::from_config(config)),
            Arc::new(Signals::new()),
            Arc::new(Stats::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_priority_and_dedup_scenario() {
        let mut sched = open(&Config::default());
        assert!(sched.enqueue_request(FetchRequest::new("http://a.com/").with_priority(5)).unwrap());
        assert!(sched.enqueue_request(FetchRequest::new("http://b.com/").with_priority(10)).unwrap());
        assert!(!sched.enqueue_request(FetchRequest::new("http://a.com/").with_priority(5)).unwrap());
        assert_eq!(sched.len(), 2);

        assert_eq!(sched.next_request(&Idle).unwrap().url, "http://b.com/");
        assert_eq!(sched.next_request(&Idle).unwrap().url, "http://a.com/");
        assert!(sched.next_request(&Idle).is_none());
        assert!(!sched.has_pending_requests());

        let snap = sched.stats().snapshot();
        assert_eq!(snap.enqueued, 2);
        assert_eq!(snap.dequeued, 2);
        assert_eq!(snap.filtered, 1);
    }

    #[test]
    fn test_dont_filter_bypasses_dupefilter() {
        let mut sched = open(&Config::default());
        assert!(sched.enqueue_request(FetchRequest::new("http://a.com/")).unwrap());
        assert!(sched.enqueue_request(FetchRequest::new("http://a.com/").dont_filter()).unwrap());
        assert!(!sched.enqueue_request(FetchRequest::new("http://a.com/")).unwrap());
        assert_eq!(sched.len(), 2);

        let req = sched.next_request(&Idle).unwrap();
        sched.requeue_request(req).unwrap();
        assert_eq!(sched.len(), 2);
    }

    #[test]
    fn test_canonical_urls_are_duplicates() {
        let mut sched = open(&Config::default());
        assert!(sched.enqueue_request(FetchRequest::new("http://a.com/?b=2&a=1")).unwrap());
        assert!(!sched.enqueue_request(FetchRequest::new("http://A.com/?a=1&b=2#top")).unwrap());
    }

    struct Broken;

    impl Fingerprinter for Broken {
        fn fingerprint(&self, _request: &FetchRequest) -> Result<Fingerprint> {
            Err(Error::InvalidConfig("no identity".to_owned()))
        }
    }

    #[test]
    fn test_fingerprint_failure_is_fatal() {
        let mut sched = CoreScheduler::open(
            &Config::default(),
            Arc::new(Broken),
            Arc::new(Signals::new()),
            Arc::new(Stats::new()),
        )
        .unwrap();
        match sched.enqueue_request(FetchRequest::new("http://a.com/x")) {
            Err(Error::Fatal { component, key, .. }) => {
                assert_eq!(component, Component::Fingerprinter);
                assert_eq!(key, "http://a.com/x");
            }
            other => panic!("expected fatal error, got {:?}", other),
        }
        // bypassing requests never reach the fingerprinter
        assert!(sched.enqueue_request(FetchRequest::new("http://a.com/x").dont_filter()).unwrap());
    }

    #[test]
    fn test_signals_fire_in_order() {
        let events = Arc::new(Mutex::new(vec![]));
        let mut signals = Signals::new();
        let log = events.clone();
        signals.connect(move |signal| {
            let name = match signal {
                Signal::SchedulerOpened { .. } => "opened".to_owned(),
                Signal::RequestScheduled(r) => format!("scheduled {}", r.url),
                Signal::RequestDropped(r) => format!("dropped {}", r.url),
                Signal::SchedulerClosed { pending } => format!("closed {}", pending),
                _ => return,
            };
            log.lock().unwrap().push(name);
        });
        let config = Config::default();
        let mut sched = CoreScheduler::open(
            &config,
            Arc::new(DefaultFingerprinter::from_config(&config)),
            Arc::new(signals),
            Arc::new(Stats::new()),
        )
        .unwrap();
        sched.enqueue_request(FetchRequest::new("http://a.com/")).unwrap();
        sched.enqueue_request(FetchRequest::new("http://a.com/")).unwrap();
        sched.close().unwrap();
        sched.close().unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "opened",
                "scheduled http://a.com/",
                "dropped http://a.com/",
                "closed 1",
            ]
        );
    }
}
