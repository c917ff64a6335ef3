use std::collections::HashSet;

use crate::error::Result;
use crate::fingerprint::Fingerprint;

use super::DupeFilter;

/// Fingerprints seen by this process. Lost on restart.
#[derive(Default)]
pub struct MemoryDupeFilter {
    fingerprints: HashSet<Fingerprint>,
}

impl MemoryDupeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

impl DupeFilter for MemoryDupeFilter {
    fn seen(&self, fp: &Fingerprint) -> bool {
        self.fingerprints.contains(fp)
    }

    fn add(&mut self, fp: Fingerprint) {
        self.fingerprints.insert(fp);
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_seen() {
        let mut f = MemoryDupeFilter::new();
        let a = Fingerprint::from_bytes(vec![1, 2, 3]);
        let b = Fingerprint::from_bytes(vec![4]);
        assert!(!f.request_seen(&a));
        assert!(f.request_seen(&a));
        assert!(!f.seen(&b));
        assert_eq!(f.len(), 1);
    }
}
