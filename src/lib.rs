mod config;
mod downloader;
mod engine;
mod error;
mod jobdir;
mod request;
mod signals;
mod spider;
mod stats;
mod storage;

pub mod dupefilter;
pub mod fingerprint;
pub mod pqueue;
pub mod scheduler;
pub mod squeue;
pub mod throttle;
pub mod util;

// (Re) Exports
pub use config::Config;
pub use downloader::{FetchError, FetchFailure, FetchResponse, Fetcher, HttpFetcher};
pub use dupefilter::{DiskDupeFilter, DupeFilter, DupeFilterKind, MemoryDupeFilter};
pub use engine::{Engine, EngineBuilder, EngineHandle};
pub use error::{Component, Error, PushError, QueueError, Result};
pub use fingerprint::{DefaultFingerprinter, Fingerprint, Fingerprinter};
pub use jobdir::{JobDir, SpiderState};
pub use pqueue::{
    ActiveSlots, DownloaderActivity, DownloaderAwarePriorityQueue, PriorityQueue, PriorityQueueKind,
    RequestQueue,
};
pub use request::{Attachment, FetchRequest, DEFAULT_PRIORITY};
pub use scheduler::{CoreScheduler, Scheduler};
pub use signals::{Signal, Signals, StopReason};
pub use spider::Spider;
pub use squeue::{
    DiskQueue, DiskQueueFactory, DownstreamQueue, MemoryQueue, MemoryQueueFactory, QueueFactory,
    QueueKind, QueueOrder,
};
pub use stats::{Stats, StatsSnapshot};
pub use storage::{KvStore, RocksStore};
pub use throttle::{AutoThrottle, FetchOutcome, HostThrottle};

pub fn engine(spider: impl Spider + 'static) -> Result<Engine<CoreScheduler>> {
    Engine::builder(Config::default(), spider).build()
}

pub fn engine_with_config(
    config: Config,
    spider: impl Spider + 'static,
) -> Result<Engine<CoreScheduler>> {
    Engine::builder(config, spider).build()
}
