use async_trait::async_trait;

use crate::downloader::{FetchFailure, FetchResponse};
use crate::jobdir::SpiderState;
use crate::request::FetchRequest;

/// Spider interface
#[async_trait]
pub trait Spider: Send + Sync {
    /// Get spider name, used in logs.
    fn name(&self) -> String;

    /// Requests the crawl starts from. They go through the dupefilter like
    /// any other, so on resume already-seen ones are skipped.
    fn start_requests(&self) -> Vec<FetchRequest>;

    /// Parse response
    ///
    /// Returns (num_processed, requests)
    ///     num_processed - the number of items processed
    ///     requests - follow-up requests to schedule
    async fn parse(&self, response: FetchResponse) -> (u64, Vec<FetchRequest>);

    /// Called for fetches that produced no response. Returned requests are
    /// scheduled, which is how a spider retries.
    async fn handle_error(&self, _failure: &FetchFailure) -> Vec<FetchRequest> {
        vec![]
    }

    /// Called before the first request with the state saved by the previous
    /// run (empty on a fresh crawl).
    fn open(&self, _state: &mut SpiderState) {}

    /// Called after the crawl stops. Whatever is left in `state` is saved to
    /// the job directory.
    fn close(&self, _state: &mut SpiderState) {}
}
