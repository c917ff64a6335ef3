use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::dupefilter::DupeFilterKind;
use crate::error::{Error, Result};
use crate::pqueue::PriorityQueueKind;
use crate::squeue::QueueKind;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// User agent sent by the default fetcher.
    pub bot_name: String,
    /// The maximum number of concurrent requests that will be performed by
    /// the downloader
    pub concurrent_requests: u32,
    /// The maximum number of concurrent requests that will be performed to
    /// any single domain. A value of 0 means that this setting will be
    /// ignored.
    pub concurrent_requests_per_domain: u32,
    /// The amount of time (in secs) that the downloader should wait before
    /// downloading consecutive pages from the same website. Also the lowest
    /// delay autothrottle will go down to.
    pub download_delay: f64,
    /// Multiply the non-adaptive delay by a random factor in [0.5, 1.5).
    pub randomize_download_delay: bool,

    pub autothrottle_enabled: bool,
    /// Delay used for a host before any latency has been observed.
    pub autothrottle_start_delay: f64,
    pub autothrottle_max_delay: f64,
    /// Average number of requests to keep in flight per host.
    pub autothrottle_target_concurrency: f64,
    /// Log every delay adjustment.
    pub autothrottle_debug: bool,

    pub priority_queue: PriorityQueueKind,
    /// Downstream queue used without a job directory.
    pub queue_kind: QueueKind,
    /// Downstream queue used with a job directory.
    pub disk_queue_kind: QueueKind,
    pub dupefilter: DupeFilterKind,
    /// Log every filtered duplicate, not just the first.
    pub dupefilter_debug: bool,

    /// Header names that take part in request identity.
    pub fingerprint_headers: Vec<String>,
    pub fingerprint_keep_fragments: bool,

    /// Directory to store crawler state. Without one nothing is persisted.
    pub job_dir: Option<PathBuf>,

    /// How long in-flight fetches may run after a stop before being aborted.
    pub shutdown_grace_secs: u64,
    /// Interval between progress reports.
    pub stats_interval_secs: u64,
    /// Stop the crawl on Ctrl-C.
    pub handle_ctrlc: bool,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.sanity_check()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn sanity_check(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidConfig(msg.to_owned()));
        if self.concurrent_requests == 0 {
            return invalid("concurrent_requests cannot be zero");
        }
        if self.concurrent_requests_per_domain > self.concurrent_requests {
            return invalid("concurrent_requests_per_domain cannot exceed concurrent_requests");
        }
        if !(self.download_delay.is_finite() && self.download_delay >= 0.0) {
            return invalid("download_delay must be a finite, positive number of seconds");
        }
        if self.autothrottle_enabled {
            if !(self.autothrottle_start_delay.is_finite() && self.autothrottle_start_delay >= 0.0) {
                return invalid("autothrottle_start_delay must be a finite, positive number of seconds");
            }
            if !self.autothrottle_max_delay.is_finite() {
                return invalid("autothrottle_max_delay must be finite");
            }
            if !(self.autothrottle_max_delay >= self.download_delay) {
                return invalid("autothrottle_max_delay cannot be lower than download_delay");
            }
            if !(self.autothrottle_target_concurrency.is_finite()
                && self.autothrottle_target_concurrency > 0.0)
            {
                return invalid("autothrottle_target_concurrency must be greater than zero");
            }
        }
        if self.job_dir.is_none() {
            if self.queue_kind.is_disk() {
                return invalid("queue_kind is a disk queue but no job_dir is set");
            }
            if self.dupefilter == DupeFilterKind::Disk {
                return invalid("dupefilter = disk requires a job_dir");
            }
        }
        if !self.disk_queue_kind.is_disk() && self.job_dir.is_some() {
            log::warn!(
                "disk_queue_kind is {:?}; pending requests will not survive a restart",
                self.disk_queue_kind
            );
        }
        Ok(())
    }

    /// The downstream queue kind in effect for this run.
    pub fn effective_queue_kind(&self) -> QueueKind {
        if self.job_dir.is_some() {
            self.disk_queue_kind
        } else {
            self.queue_kind
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot_name: "crawlq".to_owned(),
            concurrent_requests: 16,
            concurrent_requests_per_domain: 8,
            download_delay: 0.0,
            randomize_download_delay: true,
            autothrottle_enabled: false,
            autothrottle_start_delay: 5.0,
            autothrottle_max_delay: 60.0,
            autothrottle_target_concurrency: 1.0,
            autothrottle_debug: false,
            priority_queue: PriorityQueueKind::Default,
            queue_kind: QueueKind::MemoryLifo,
            disk_queue_kind: QueueKind::DiskLifo,
            dupefilter: DupeFilterKind::Memory,
            dupefilter_debug: false,
            fingerprint_headers: vec![],
            fingerprint_keep_fragments: false,
            job_dir: None,
            shutdown_grace_secs: 10,
            stats_interval_secs: 60,
            handle_ctrlc: true,
        }
    }
}
