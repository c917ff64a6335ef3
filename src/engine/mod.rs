use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;

mod reporting_task;
mod slots;

use crate::Config;
use crate::downloader::{Fetcher, HttpFetcher};
use crate::error::{Error, Result};
use crate::fingerprint::{DefaultFingerprinter, Fingerprinter};
use crate::jobdir::{JobDir, SpiderState};
use crate::request::FetchRequest;
use crate::scheduler::{CoreScheduler, Scheduler};
use crate::signals::{Signal, Signals, StopReason};
use crate::spider::Spider;
use crate::stats::Stats;
use crate::throttle::{AutoThrottle, FetchOutcome, DONT_ADJUST_DELAY};
use crate::util;

use reporting_task::start_reporting_task;
use slots::{Gate, Slots};

/// Longest the loop sleeps when nothing else will wake it.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Lower bound on the ready buffer size.
const MIN_HELD: usize = 64;

/// Control a running engine from elsewhere.
#[derive(Clone)]
pub struct EngineHandle {
    stop_tx: broadcast::Sender<()>,
    submit_tx: mpsc::UnboundedSender<FetchRequest>,
}

impl EngineHandle {
    /// Stop admitting requests, drain in-flight fetches within the grace
    /// period and persist what is left.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    /// Schedule a request from outside the spider. Returns `false` once the
    /// engine has stopped.
    pub fn submit(&self, request: FetchRequest) -> bool {
        self.submit_tx.send(request).is_ok()
    }
}

/// A finished fetch task, success or not.
struct Completion {
    request: FetchRequest,
    host: String,
    /// Base for resolving relative follow-up URLs.
    base_url: String,
    outcome: FetchOutcome,
    latency: Duration,
    processed: u64,
    follow_ups: Vec<FetchRequest>,
}

/// What one batch of pops produced.
enum Popped {
    /// A slot is already reserved for the request.
    Ready(FetchRequest, String),
    /// The scheduler handed out a request whose host is not available.
    Held(FetchRequest),
}

/// Dispatch state. Only the engine loop touches it, except for the gate,
/// which the blocking pool borrows while the scheduler pops.
struct Crawl {
    gate: Arc<Mutex<Gate>>,
    /// Popped requests waiting for their host to become available.
    held: VecDeque<FetchRequest>,
    max_held: usize,
    tasks: JoinSet<Completion>,
}

impl Crawl {
    fn new(config: &Config) -> Self {
        let global = config.concurrent_requests as usize;
        let gate = Gate {
            slots: Slots::new(global, config.concurrent_requests_per_domain as usize),
            throttle: AutoThrottle::new(config),
        };
        Self {
            gate: Arc::new(Mutex::new(gate)),
            held: VecDeque::new(),
            max_held: (global * 4).max(MIN_HELD),
            tasks: JoinSet::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.tasks.is_empty() && self.held.is_empty()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct EngineBuilder {
    config: Config,
    spider: Arc<dyn Spider>,
    fetcher: Option<Arc<dyn Fetcher>>,
    fingerprinter: Option<Arc<dyn Fingerprinter>>,
    signals: Signals,
}

impl EngineBuilder {
    /// Replace the default reqwest fetcher.
    pub fn fetcher(mut self, fetcher: impl Fetcher + 'static) -> Self {
        self.fetcher = Some(Arc::new(fetcher));
        self
    }

    pub fn fingerprinter(mut self, fingerprinter: impl Fingerprinter + 'static) -> Self {
        self.fingerprinter = Some(Arc::new(fingerprinter));
        self
    }

    pub fn on_signal<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Signal<'_>) + Send + Sync + 'static,
    {
        self.signals.connect(handler);
        self
    }

    pub fn build(self) -> Result<Engine<CoreScheduler>> {
        self.config.sanity_check()?;
        let stats = Arc::new(Stats::new());
        let signals = Arc::new(self.signals);
        let fingerprinter: Arc<dyn Fingerprinter> = match self.fingerprinter {
            Some(f) => f,
            None => Arc::new(DefaultFingerprinter::from_config(&self.config)),
        };
        let fetcher: Arc<dyn Fetcher> = match self.fetcher {
            Some(f) => f,
            None => Arc::new(HttpFetcher::new(&self.config)?),
        };
        let scheduler = CoreScheduler::open(&self.config, fingerprinter, signals.clone(), stats.clone())?;
        Ok(Engine::with_scheduler(
            self.config,
            scheduler,
            self.spider,
            fetcher,
            signals,
            stats,
        ))
    }
}

// The scheduler is shared with the blocking pool, where every call into it
// runs so that queue and dupefilter storage never stalls the runtime. The
// loop in `start` is still the single point where requests are admitted,
// popped and completed.
pub struct Engine<Sched>
where
    Sched: Scheduler + Send + 'static,
{
    config: Arc<Config>,
    scheduler: Arc<Mutex<Sched>>,
    spider: Arc<dyn Spider>,
    fetcher: Arc<dyn Fetcher>,
    signals: Arc<Signals>,
    stats: Arc<Stats>,
    stop_tx: broadcast::Sender<()>,
    stop_rx: broadcast::Receiver<()>,
    submit_tx: mpsc::UnboundedSender<FetchRequest>,
    submit_rx: mpsc::UnboundedReceiver<FetchRequest>,
}

impl Engine<CoreScheduler> {
    pub fn builder(config: Config, spider: impl Spider + 'static) -> EngineBuilder {
        EngineBuilder {
            config,
            spider: Arc::new(spider),
            fetcher: None,
            fingerprinter: None,
            signals: Signals::new(),
        }
    }
}

impl<Sched> Engine<Sched>
where
    Sched: Scheduler + Send + 'static,
{
    pub fn with_scheduler(
        config: Config,
        scheduler: Sched,
        spider: Arc<dyn Spider>,
        fetcher: Arc<dyn Fetcher>,
        signals: Arc<Signals>,
        stats: Arc<Stats>,
    ) -> Self {
        let (stop_tx, stop_rx) = broadcast::channel::<()>(32);
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        Self {
            config: Arc::new(config),
            scheduler: Arc::new(Mutex::new(scheduler)),
            spider,
            fetcher,
            signals,
            stats,
            stop_tx,
            stop_rx,
            submit_tx,
            submit_rx,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            stop_tx: self.stop_tx.clone(),
            submit_tx: self.submit_tx.clone(),
        }
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Direct access to the scheduler. Not meant to be held across a running
    /// crawl.
    pub fn scheduler(&self) -> MutexGuard<'_, Sched> {
        lock(&self.scheduler)
    }

    /// Run the crawl until it finishes, is stopped, or hits a fatal scheduler
    /// error. In every case pending requests and spider state are persisted
    /// before returning.
    pub async fn start(&mut self) -> Result<StopReason> {
        let config = self.config.clone();
        config.sanity_check()?;

        if config.handle_ctrlc {
            let tx = self.stop_tx.clone();
            if let Err(e) = ctrlc::set_handler(move || {
                let _ = tx.send(());
            }) {
                log::warn!("cannot install Ctrl-C handler: {}", e);
            }
        }

        let jobdir = config.job_dir.as_ref().map(JobDir::open).transpose()?;
        let mut state = match &jobdir {
            Some(jobdir) => jobdir.load_state()?,
            None => SpiderState::default(),
        };

        log::info!("Spider {} opened", self.spider.name());
        self.signals.emit(Signal::EngineStarted);
        self.spider.open(&mut state);

        let reporter = start_reporting_task(
            self.stats.clone(),
            config.stats_interval(),
            self.stop_tx.clone(),
        );

        let mut crawl = Crawl::new(&config);
        let mut result = self.enqueue_all(self.spider.start_requests()).await;
        let mut reason = StopReason::Shutdown;
        if result.is_ok() {
            match self.run(&mut crawl).await {
                Ok(r) => reason = r,
                Err(e) => result = Err(e),
            }
        }
        let drained = self.drain(&mut crawl, result.is_ok()).await;
        if result.is_ok() {
            result = drained;
        }

        let _ = self.stop_tx.send(());
        let _ = reporter.await;
        self.submit_rx.close();

        let closed = self
            .on_scheduler(|scheduler| scheduler.close())
            .await
            .and_then(|closed| closed);
        self.spider.close(&mut state);
        let saved = match &jobdir {
            Some(jobdir) => jobdir.save_state(&state),
            None => Ok(()),
        };

        if let Err(e) = &result {
            log::error!("Crawl halted: {}", e);
            reason = StopReason::Fatal(e.to_string());
        }
        log::info!("Spider {} closed ({})", self.spider.name(), reason);
        self.signals.emit(Signal::EngineStopped(&reason));

        result?;
        closed?;
        saved?;
        Ok(reason)
    }

    async fn run(&mut self, crawl: &mut Crawl) -> Result<StopReason> {
        loop {
            let mut submitted = vec![];
            while let Ok(request) = self.submit_rx.try_recv() {
                submitted.push(request);
            }
            self.enqueue_all(submitted).await?;

            self.dispatch(crawl).await?;

            if crawl.is_idle() && !self.on_scheduler(|s| s.has_pending_requests()).await? {
                return Ok(StopReason::Finished);
            }

            let now = Instant::now();
            let wake = match lock(&crawl.gate).throttle.next_wakeup(now) {
                Some(t) => t.min(now + IDLE_POLL),
                None => now + IDLE_POLL,
            };

            tokio::select! {
                _ = self.stop_rx.recv() => {
                    return Ok(StopReason::Shutdown);
                }
                Some(joined) = crawl.tasks.join_next() => {
                    if let Some(completion) = completed(joined) {
                        self.complete(crawl, completion, true).await?;
                    }
                }
                Some(request) = self.submit_rx.recv() => {
                    self.enqueue_all(vec![request]).await?;
                }
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    /// Run `f` against the scheduler on the blocking pool, where storage I/O
    /// cannot hold up the fetch tasks sharing the runtime.
    async fn on_scheduler<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Sched) -> T + Send + 'static,
        T: Send + 'static,
    {
        let scheduler = self.scheduler.clone();
        match tokio::task::spawn_blocking(move || f(&mut *lock(&scheduler))).await {
            Ok(out) => Ok(out),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("scheduler task cancelled: {}", e),
            ))),
        }
    }

    async fn enqueue_all(&self, requests: Vec<FetchRequest>) -> Result<()> {
        if requests.is_empty() {
            return Ok(());
        }
        self.on_scheduler(move |scheduler| {
            requests
                .into_iter()
                .try_for_each(|request| scheduler.enqueue_request(request).map(|_| ()))
        })
        .await?
    }

    /// Hand every dispatchable request to a fetch task: held requests first,
    /// then one batch of fresh pops until capacity or the ready buffer runs
    /// out.
    async fn dispatch(&self, crawl: &mut Crawl) -> Result<()> {
        let now = Instant::now();

        let mut ready = vec![];
        let has_capacity = {
            let mut gate = lock(&crawl.gate);
            for request in std::mem::take(&mut crawl.held) {
                let host = request.host();
                if gate.slots.has_capacity() && gate.is_available(&host, now) {
                    gate.reserve(&host, now);
                    ready.push((request, host));
                } else {
                    crawl.held.push_back(request);
                }
            }
            gate.slots.has_capacity()
        };
        for (request, host) in ready {
            self.spawn_fetch(crawl, request, host);
        }

        let room = crawl.max_held.saturating_sub(crawl.held.len());
        if !has_capacity || room == 0 {
            return Ok(());
        }
        let gate = crawl.gate.clone();
        let batch = self
            .on_scheduler(move |scheduler| pop_batch(scheduler, &gate, now, room))
            .await?;
        for popped in batch {
            match popped {
                Popped::Ready(request, host) => self.spawn_fetch(crawl, request, host),
                Popped::Held(request) => {
                    log::debug!("Holding {} until its host is available", request.url);
                    self.stats.incr_held();
                    crawl.held.push_back(request);
                }
            }
        }
        Ok(())
    }

    /// Start the fetch for a request whose slot is already reserved.
    fn spawn_fetch(&self, crawl: &mut Crawl, request: FetchRequest, host: String) {
        self.signals.emit(Signal::RequestReachedDownloader(&request));
        log::debug!("Crawling {}", request.url);

        let fetcher = self.fetcher.clone();
        let spider = self.spider.clone();
        crawl.tasks.spawn(async move {
            let started = Instant::now();
            match fetcher.fetch(request).await {
                Ok(response) => {
                    let request = response.request.clone();
                    let base_url = response.url.clone();
                    let outcome = FetchOutcome::Status(response.status);
                    let latency = response.latency;
                    let (processed, follow_ups) = spider.parse(response).await;
                    Completion {
                        request,
                        host,
                        base_url,
                        outcome,
                        latency,
                        processed,
                        follow_ups,
                    }
                }
                Err(failure) => {
                    let latency = started.elapsed();
                    let follow_ups = spider.handle_error(&failure).await;
                    Completion {
                        base_url: failure.request.url.clone(),
                        request: failure.request,
                        host,
                        outcome: FetchOutcome::Failed,
                        latency,
                        processed: 0,
                        follow_ups,
                    }
                }
            }
        });
    }

    async fn complete(&self, crawl: &mut Crawl, c: Completion, admit: bool) -> Result<()> {
        {
            let mut gate = lock(&crawl.gate);
            gate.slots.release(&c.host);
            gate.throttle.on_response(
                &c.host,
                c.latency,
                c.outcome,
                c.request.meta_flag(DONT_ADJUST_DELAY),
            );
        }

        let status = match c.outcome {
            FetchOutcome::Status(status) => {
                self.stats.incr_total_crawled();
                Some(status)
            }
            FetchOutcome::Failed => {
                self.stats.incr_exceptions();
                None
            }
        };
        self.stats.add_total_processed(c.processed);
        self.signals.emit(Signal::ResponseReceived {
            request: &c.request,
            status,
            latency: c.latency,
        });

        if admit {
            self.enqueue_all(normalize_requests(&c.base_url, c.follow_ups))
                .await?;
        }
        Ok(())
    }

    /// Let in-flight fetches finish within the grace period, abort the rest,
    /// and put held requests back in the scheduler. Follow-ups are still
    /// admitted when `admit` is set, so they get persisted.
    async fn drain(&mut self, crawl: &mut Crawl, mut admit: bool) -> Result<()> {
        let mut result = Ok(());
        let grace = self.config.shutdown_grace();
        let deadline = Instant::now() + grace;
        if !crawl.tasks.is_empty() {
            log::info!(
                "Waiting up to {:?} for {} in-flight requests",
                grace,
                lock(&crawl.gate).slots.total()
            );
        }

        while !crawl.tasks.is_empty() {
            tokio::select! {
                Some(joined) = crawl.tasks.join_next() => {
                    let completion = match completed(joined) {
                        Some(completion) => self.complete(crawl, completion, admit).await,
                        None => Ok(()),
                    };
                    if let Err(e) = completion {
                        admit = false;
                        result = Err(e);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if let Err(e) = self.abort_in_flight(crawl, admit).await {
                        admit = false;
                        result = Err(e);
                    }
                }
            }
        }

        if admit {
            let mut submitted = vec![];
            while let Ok(request) = self.submit_rx.try_recv() {
                submitted.push(request);
            }
            if let Err(e) = self.enqueue_all(submitted).await {
                result = Err(e);
            }
        }

        let held: Vec<FetchRequest> = crawl.held.drain(..).collect();
        if !held.is_empty() {
            let requeued = self
                .on_scheduler(move |scheduler| {
                    for request in held {
                        if let Err(e) = scheduler.requeue_request(request) {
                            log::error!("cannot requeue held request: {}", e);
                        }
                    }
                })
                .await;
            if let Err(e) = requeued {
                log::error!("cannot requeue held requests: {}", e);
            }
        }
        result
    }

    /// Abort the fetches still running. Those that had already finished are
    /// completed as usual.
    async fn abort_in_flight(&self, crawl: &mut Crawl, mut admit: bool) -> Result<()> {
        log::warn!("Aborting {} in-flight requests", crawl.tasks.len());
        crawl.tasks.abort_all();
        let mut result = Ok(());
        while let Some(joined) = crawl.tasks.join_next().await {
            let Some(completion) = completed(joined) else {
                continue;
            };
            if let Err(e) = self.complete(crawl, completion, admit).await {
                admit = false;
                result = Err(e);
            }
        }
        result
    }
}

/// Pop until the downloader is full, reserving a slot for every request
/// whose host is available. Runs on the blocking pool; `room` bounds how many
/// unavailable requests a scheduler that ignores activity can hand out.
fn pop_batch<S: Scheduler>(
    scheduler: &mut S,
    gate: &Mutex<Gate>,
    now: Instant,
    room: usize,
) -> Vec<Popped> {
    let mut gate = lock(gate);
    let mut batch = vec![];
    let mut held = 0;
    while gate.slots.has_capacity() && held < room {
        let Some(request) = scheduler.next_request(&gate.availability(now)) else {
            break;
        };
        let host = request.host();
        if gate.is_available(&host, now) {
            gate.reserve(&host, now);
            batch.push(Popped::Ready(request, host));
        } else {
            held += 1;
            batch.push(Popped::Held(request));
        }
    }
    batch
}

/// Unwrap a joined fetch task. Aborted tasks yield nothing; a panic in the
/// spider or fetcher is re-raised.
fn completed(joined: std::result::Result<Completion, JoinError>) -> Option<Completion> {
    match joined {
        Ok(completion) => Some(completion),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => None,
    }
}

/// Resolve follow-up URLs against the page they came from and keep only
/// http(s) ones.
fn normalize_requests(base_url: &str, requests: Vec<FetchRequest>) -> Vec<FetchRequest> {
    requests
        .into_iter()
        .filter_map(|mut request| {
            let absolute = util::join_url(base_url, &request.url)?;
            if !(absolute.starts_with("http://") || absolute.starts_with("https://")) {
                return None;
            }
            if absolute != request.url {
                request.url = absolute;
                request.clear_fingerprint();
            }
            Some(request)
        })
        .collect()
}
