use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use crawlq::{
    Config, DupeFilterKind, Engine, FetchError, FetchFailure, FetchRequest, FetchResponse, Fetcher,
    PriorityQueueKind, QueueKind, Scheduler, Signal, Spider, SpiderState, StopReason,
};
use tokio::time::Instant;

const LATENCY: Duration = Duration::from_millis(100);

/// Serves canned pages. A page body is its outgoing links, one per line.
#[derive(Clone, Default)]
struct MockFetcher {
    pages: Arc<HashMap<String, Vec<String>>>,
    down: Arc<BTreeSet<String>>,
    dispatched: Arc<Mutex<Vec<(String, Instant)>>>,
}

impl MockFetcher {
    fn new(pages: &[(&str, &[&str])]) -> Self {
        let pages = pages
            .iter()
            .map(|(url, links)| {
                let links = links.iter().map(|l| l.to_string()).collect();
                (url.to_string(), links)
            })
            .collect();
        Self {
            pages: Arc::new(pages),
            ..Default::default()
        }
    }

    fn with_down(mut self, url: &str) -> Self {
        self.down = Arc::new([url.to_string()].into_iter().collect());
        self
    }

    fn dispatched(&self) -> Vec<(String, Instant)> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchFailure> {
        self.dispatched
            .lock()
            .unwrap()
            .push((request.url.clone(), Instant::now()));
        tokio::time::sleep(LATENCY).await;

        if self.down.contains(&request.url) {
            return Err(FetchFailure {
                request,
                error: FetchError::Other("connection refused".to_owned()),
            });
        }
        let (status, body) = match self.pages.get(&request.url) {
            Some(links) => (200, links.join("\n").into_bytes()),
            None => (404, vec![]),
        };
        Ok(FetchResponse {
            url: request.url.clone(),
            request,
            status,
            headers: vec![],
            body,
            latency: LATENCY,
        })
    }
}

/// Follows every link in the body and retries failed fetches once.
#[derive(Default)]
struct LinkSpider {
    start: Vec<FetchRequest>,
    pages: Mutex<u64>,
    resumed_pages: Mutex<Option<u64>>,
}

impl LinkSpider {
    fn new(start: &[&str]) -> Self {
        Self {
            start: start.iter().map(|url| FetchRequest::new(*url)).collect(),
            ..Default::default()
        }
    }

    fn with_requests(start: Vec<FetchRequest>) -> Self {
        Self {
            start,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Spider for LinkSpider {
    fn name(&self) -> String {
        "link-spider".to_owned()
    }

    fn start_requests(&self) -> Vec<FetchRequest> {
        self.start.clone()
    }

    async fn parse(&self, response: FetchResponse) -> (u64, Vec<FetchRequest>) {
        if !response.is_success() {
            return (0, vec![]);
        }
        *self.pages.lock().unwrap() += 1;
        let requests = response
            .text()
            .lines()
            .filter(|l| !l.is_empty())
            .map(FetchRequest::new)
            .collect();
        (1, requests)
    }

    async fn handle_error(&self, failure: &FetchFailure) -> Vec<FetchRequest> {
        if failure.request.meta_flag("retried") {
            return vec![];
        }
        vec![failure
            .request
            .clone()
            .dont_filter()
            .with_meta("retried", serde_json::json!(true))]
    }

    fn open(&self, state: &mut SpiderState) {
        let pages = state.get("pages").and_then(|v| v.as_u64());
        *self.resumed_pages.lock().unwrap() = pages;
        *self.pages.lock().unwrap() = pages.unwrap_or(0);
    }

    fn close(&self, state: &mut SpiderState) {
        state.insert("pages", serde_json::json!(*self.pages.lock().unwrap()));
    }
}

fn test_config() -> Config {
    Config {
        handle_ctrlc: false,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn crawl_follows_links_and_skips_duplicates() {
    let fetcher = MockFetcher::new(&[
        ("http://a.example/", &["/x", "/y"]),
        ("http://a.example/x", &["/", "/y", "http://b.example/"]),
        ("http://a.example/y", &[]),
    ]);
    let mut engine = Engine::builder(test_config(), LinkSpider::new(&["http://a.example/"]))
        .fetcher(fetcher.clone())
        .build()
        .unwrap();

    let reason = engine.start().await.unwrap();
    assert_eq!(reason, StopReason::Finished);

    let fetched: BTreeSet<String> = fetcher.dispatched().into_iter().map(|(u, _)| u).collect();
    let expected: BTreeSet<String> = [
        "http://a.example/",
        "http://a.example/x",
        "http://a.example/y",
        "http://b.example/",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    assert_eq!(fetched, expected);

    let snap = engine.stats().snapshot();
    assert_eq!(snap.crawled, 4);
    assert_eq!(snap.processed, 3);
    assert_eq!(snap.filtered, 2);
    assert_eq!(snap.exceptions, 0);
}

#[tokio::test(start_paused = true)]
async fn download_delay_is_per_host() {
    let fetcher = MockFetcher::new(&[]);
    let config = Config {
        download_delay: 1.0,
        randomize_download_delay: false,
        ..test_config()
    };
    let spider = LinkSpider::new(&[
        "http://a.example/1",
        "http://a.example/2",
        "http://b.example/1",
        "http://b.example/2",
    ]);
    let mut engine = Engine::builder(config, spider)
        .fetcher(fetcher.clone())
        .build()
        .unwrap();
    assert_eq!(engine.start().await.unwrap(), StopReason::Finished);

    let dispatched = fetcher.dispatched();
    assert_eq!(dispatched.len(), 4);
    for host in ["a.example", "b.example"] {
        let times = times_for(&dispatched, host);
        assert_eq!(times.len(), 2);
        assert!(times[1] - times[0] >= Duration::from_secs(1), "{}", host);
    }

    // Hosts wait in parallel, not behind each other.
    let first = dispatched.iter().map(|(_, t)| *t).min().unwrap();
    let last = dispatched.iter().map(|(_, t)| *t).max().unwrap();
    assert!(last - first < Duration::from_secs(2));
}

/// Dispatch times of the requests whose URL contains `host`.
fn times_for(dispatched: &[(String, Instant)], host: &str) -> Vec<Instant> {
    dispatched
        .iter()
        .filter(|(u, _)| u.contains(host))
        .map(|(_, t)| *t)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn delayed_host_does_not_block_other_hosts() {
    let config = Config {
        download_delay: 1.0,
        randomize_download_delay: false,
        ..test_config()
    };
    let mut start: Vec<FetchRequest> = (0..100)
        .map(|i| FetchRequest::new(format!("http://a.example/{}", i)).with_priority(1))
        .collect();
    start.push(FetchRequest::new("http://b.example/"));
    let fetcher = MockFetcher::new(&[]);
    let mut engine = Engine::builder(config, LinkSpider::with_requests(start))
        .fetcher(fetcher.clone())
        .build()
        .unwrap();
    let started = Instant::now();
    assert_eq!(engine.start().await.unwrap(), StopReason::Finished);

    let dispatched = fetcher.dispatched();
    assert_eq!(dispatched.len(), 101);
    let b = times_for(&dispatched, "b.example");
    assert!(b[0] - started < Duration::from_secs(2), "b.example waited {:?}", b[0] - started);

    let a = times_for(&dispatched, "a.example");
    assert_eq!(a.len(), 100);
    assert!(a.windows(2).all(|w| w[1] - w[0] >= Duration::from_secs(1)));
    // Priority order still holds within the delayed host.
    let first_a = dispatched.iter().find(|(u, _)| u.contains("a.example")).unwrap();
    assert_eq!(first_a.0, "http://a.example/0");
}

#[tokio::test(start_paused = true)]
async fn downloader_aware_crawl_covers_every_host() {
    let fetcher = MockFetcher::new(&[
        ("http://a.example/", &["/1", "/2", "http://b.example/", "http://c.example/"]),
        ("http://a.example/1", &["http://c.example/1"]),
        ("http://a.example/2", &[]),
        ("http://b.example/", &["/1", "http://a.example/"]),
        ("http://b.example/1", &[]),
        ("http://c.example/", &["/1"]),
        ("http://c.example/1", &[]),
    ]);
    let config = Config {
        priority_queue: PriorityQueueKind::DownloaderAware,
        concurrent_requests_per_domain: 1,
        ..test_config()
    };
    let mut engine = Engine::builder(config, LinkSpider::new(&["http://a.example/"]))
        .fetcher(fetcher.clone())
        .build()
        .unwrap();
    assert_eq!(engine.start().await.unwrap(), StopReason::Finished);

    let dispatched = fetcher.dispatched();
    let fetched: BTreeSet<String> = dispatched.iter().map(|(u, _)| u.clone()).collect();
    assert_eq!(fetched.len(), 7);
    assert_eq!(dispatched.len(), 7);
    for host in ["a.example", "b.example", "c.example"] {
        let times = times_for(&dispatched, host);
        // One fetch at a time per host.
        assert!(times.windows(2).all(|w| w[1] - w[0] >= LATENCY), "{}", host);
    }
    let snap = engine.stats().snapshot();
    assert_eq!(snap.crawled, 7);
    assert_eq!(snap.filtered, 2);
}

#[tokio::test(start_paused = true)]
async fn autothrottle_holds_delay_after_failure() {
    let fetcher = MockFetcher::new(&[
        ("http://b.example/ok", &["/next"]),
        ("http://b.example/next", &[]),
    ])
    .with_down("http://a.example/down");
    let config = Config {
        autothrottle_enabled: true,
        autothrottle_start_delay: 1.0,
        autothrottle_max_delay: 60.0,
        autothrottle_target_concurrency: 1.0,
        ..test_config()
    };
    let spider = LinkSpider::new(&["http://a.example/down", "http://b.example/ok"]);
    let mut engine = Engine::builder(config, spider)
        .fetcher(fetcher.clone())
        .build()
        .unwrap();
    assert_eq!(engine.start().await.unwrap(), StopReason::Finished);

    let dispatched = fetcher.dispatched();
    let a = times_for(&dispatched, "a.example");
    let b = times_for(&dispatched, "b.example");
    assert_eq!((a.len(), b.len()), (2, 2));
    // A success pulls the delay halfway towards the latency; a failure
    // keeps it where it was.
    assert!(b[1] - b[0] < Duration::from_secs(1), "b.example gap {:?}", b[1] - b[0]);
    assert!(a[1] - a[0] >= Duration::from_secs(1), "a.example gap {:?}", a[1] - a[0]);
}

#[tokio::test(start_paused = true)]
async fn failed_fetch_is_retried_by_the_spider() {
    let fetcher = MockFetcher::new(&[]).with_down("http://a.example/down");
    let mut engine = Engine::builder(test_config(), LinkSpider::new(&["http://a.example/down"]))
        .fetcher(fetcher.clone())
        .build()
        .unwrap();

    assert_eq!(engine.start().await.unwrap(), StopReason::Finished);
    assert_eq!(fetcher.dispatched().len(), 2);
    let snap = engine.stats().snapshot();
    assert_eq!(snap.exceptions, 2);
    assert_eq!(snap.crawled, 0);
}

#[tokio::test(start_paused = true)]
async fn submitted_requests_are_crawled() {
    let fetcher = MockFetcher::new(&[("http://a.example/", &[])]);
    let mut engine = Engine::builder(test_config(), LinkSpider::new(&[]))
        .fetcher(fetcher.clone())
        .build()
        .unwrap();
    assert!(engine.handle().submit(FetchRequest::new("http://a.example/")));

    assert_eq!(engine.start().await.unwrap(), StopReason::Finished);
    assert_eq!(engine.stats().total_crawled(), 1);
    // The engine is gone; nothing takes submissions anymore.
    assert!(!engine.handle().submit(FetchRequest::new("http://a.example/late")));
}

#[tokio::test(start_paused = true)]
async fn signals_bracket_the_crawl() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let fetcher = MockFetcher::new(&[("http://a.example/", &[])]);
    let mut engine = Engine::builder(test_config(), LinkSpider::new(&["http://a.example/"]))
        .fetcher(fetcher)
        .on_signal(move |signal| {
            let name = match signal {
                Signal::EngineStarted => "engine_started",
                Signal::SchedulerOpened { .. } => "scheduler_opened",
                Signal::RequestScheduled(_) => "request_scheduled",
                Signal::RequestDropped(_) => "request_dropped",
                Signal::RequestReachedDownloader(_) => "request_reached_downloader",
                Signal::ResponseReceived { .. } => "response_received",
                Signal::SchedulerClosed { .. } => "scheduler_closed",
                Signal::EngineStopped(_) => "engine_stopped",
            };
            sink.lock().unwrap().push(name);
        })
        .build()
        .unwrap();
    engine.start().await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            "scheduler_opened",
            "engine_started",
            "request_scheduled",
            "request_reached_downloader",
            "response_received",
            "scheduler_closed",
            "engine_stopped",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn stopped_crawl_resumes_from_job_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        concurrent_requests: 1,
        concurrent_requests_per_domain: 1,
        queue_kind: QueueKind::MemoryFifo,
        disk_queue_kind: QueueKind::DiskFifo,
        dupefilter: DupeFilterKind::Disk,
        job_dir: Some(dir.path().to_path_buf()),
        ..test_config()
    };
    let start = [
        "http://a.example/1",
        "http://a.example/2",
        "http://a.example/3",
        "http://a.example/4",
    ];
    let pages: Vec<(&str, &[&str])> = start.iter().map(|u| (*u, &[][..])).collect();
    let fetcher = MockFetcher::new(&pages);

    let mut engine = Engine::builder(config.clone(), LinkSpider::new(&start))
        .fetcher(fetcher.clone())
        .build()
        .unwrap();
    // Stop before anything runs: the first dispatch still goes out and is
    // drained, the rest stays queued on disk.
    engine.handle().stop();
    assert_eq!(engine.start().await.unwrap(), StopReason::Shutdown);
    assert_eq!(engine.stats().total_crawled(), 1);
    drop(engine);

    let spider = Arc::new(LinkSpider::new(&start));
    let mut engine = Engine::builder(config, SharedSpider(spider.clone()))
        .fetcher(fetcher.clone())
        .build()
        .unwrap();
    assert_eq!(engine.scheduler().len(), 3);
    assert_eq!(engine.start().await.unwrap(), StopReason::Finished);

    let snap = engine.stats().snapshot();
    assert_eq!(snap.crawled, 3);
    // Start requests were all seen by the first run.
    assert_eq!(snap.filtered, 4);
    assert_eq!(*spider.resumed_pages.lock().unwrap(), Some(1));
    assert_eq!(*spider.pages.lock().unwrap(), 4);

    let urls: Vec<String> = fetcher.dispatched().into_iter().map(|(u, _)| u).collect();
    assert_eq!(urls, start);
}

/// Lets a test keep a reference to the spider the engine owns.
struct SharedSpider(Arc<LinkSpider>);

#[async_trait]
impl Spider for SharedSpider {
    fn name(&self) -> String {
        self.0.name()
    }

    fn start_requests(&self) -> Vec<FetchRequest> {
        self.0.start_requests()
    }

    async fn parse(&self, response: FetchResponse) -> (u64, Vec<FetchRequest>) {
        self.0.parse(response).await
    }

    async fn handle_error(&self, failure: &FetchFailure) -> Vec<FetchRequest> {
        self.0.handle_error(failure).await
    }

    fn open(&self, state: &mut SpiderState) {
        self.0.open(state)
    }

    fn close(&self, state: &mut SpiderState) {
        self.0.close(state)
    }
}
