//! Duplicate request filtering by fingerprint.

use serde::Deserialize;

use crate::error::Result;
use crate::fingerprint::Fingerprint;

mod disk;
mod memory;

pub use disk::DiskDupeFilter;
pub use memory::MemoryDupeFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DupeFilterKind {
    Memory,
    Disk,
}

pub trait DupeFilter: Send {
    fn seen(&self, fp: &Fingerprint) -> bool;

    fn add(&mut self, fp: Fingerprint);

    /// Check and record in one step. Returns whether `fp` was already known.
    ///
    /// Only the scheduler calls this, from a single task, so two submissions
    /// of the same identity cannot both get `false`.
    fn request_seen(&mut self, fp: &Fingerprint) -> bool {
        if self.seen(fp) {
            return true;
        }
        self.add(fp.clone());
        false
    }

    fn close(&mut self) -> Result<()>;
}
