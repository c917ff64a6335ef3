//! Crawl a single site, resumable.
//!
//!     RUST_LOG=info cargo run --example crawl -- https://example.com/ ./job
//!
//! Stop it with Ctrl-C and run the same command again to pick up where it
//! left off.

use std::sync::Mutex;

use async_trait::async_trait;
use crawlq::util::{get_host, join_url};
use crawlq::{Config, DupeFilterKind, FetchRequest, FetchResponse, PriorityQueueKind, Spider, SpiderState};
use scraper::{Html, Selector};

pub struct SiteSpider {
    start_url: String,
    host: String,
    pages: Mutex<u64>,
}

#[async_trait]
impl Spider for SiteSpider {
    fn name(&self) -> String {
        format!("site-spider ({})", self.host)
    }

    fn start_requests(&self) -> Vec<FetchRequest> {
        vec![FetchRequest::new(self.start_url.clone())]
    }

    async fn parse(&self, response: FetchResponse) -> (u64, Vec<FetchRequest>) {
        let is_html = response
            .headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("content-type") && v.starts_with("text/html"));
        if !response.is_success() || !is_html {
            return (0, vec![]);
        }

        let text = response.text();
        let mut requests = vec![];
        {
            let document = Html::parse_document(&text);
            let link_selector = Selector::parse("a").unwrap();
            for link in document.select(&link_selector) {
                let Some(href) = link.value().attr("href") else {
                    continue;
                };
                let Some(url) = join_url(&response.url, href) else {
                    continue;
                };
                if get_host(&url).as_deref() == Some(self.host.as_str()) {
                    // Shallow pages first.
                    let depth = url.matches('/').count() as i32;
                    requests.push(FetchRequest::new(url).with_priority(-depth));
                }
            }

            let title_selector = Selector::parse("title").unwrap();
            let title = match document.select(&title_selector).next() {
                Some(el) => el.inner_html(),
                None => "".to_owned(),
            };
            println!("{},{}", response.url, title.trim());
        }

        *self.pages.lock().unwrap() += 1;
        (1, requests)
    }

    fn open(&self, state: &mut SpiderState) {
        let pages = state.get("pages").and_then(|v| v.as_u64()).unwrap_or(0);
        *self.pages.lock().unwrap() = pages;
    }

    fn close(&self, state: &mut SpiderState) {
        let pages = *self.pages.lock().unwrap();
        log::info!("{} pages parsed in total", pages);
        state.insert("pages", serde_json::json!(pages));
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let start_url = args.next().unwrap_or_else(|| "https://example.com/".to_owned());
    let job_dir = args.next();
    let host = get_host(&start_url).expect("start url must have a host");

    let config = Config {
        concurrent_requests: 8,
        concurrent_requests_per_domain: 4,
        autothrottle_enabled: true,
        autothrottle_start_delay: 1.0,
        download_delay: 0.25,
        priority_queue: PriorityQueueKind::DownloaderAware,
        dupefilter: if job_dir.is_some() {
            DupeFilterKind::Disk
        } else {
            DupeFilterKind::Memory
        },
        job_dir: job_dir.map(Into::into),
        ..Default::default()
    };

    let spider = SiteSpider {
        start_url,
        host,
        pages: Mutex::new(0),
    };
    let mut engine = crawlq::engine_with_config(config, spider).expect("invalid configuration");
    match engine.start().await {
        Ok(reason) => log::info!("Exit gracefully ({})", reason),
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    }
}
