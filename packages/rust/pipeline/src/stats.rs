//! Run statistics shared across pipeline stages.
//!
//! Counters live behind an `Arc` and are cloned into every record at fan-out
//! points, so increments survive across branches and partial failures. Nodes
//! increment named counters rather than returning counts.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Shared, mutable statistics accumulator for one crawl run.
#[derive(Debug, Clone, Default)]
pub struct Stats(Arc<StatsInner>);

#[derive(Debug, Default)]
struct StatsInner {
    fetched: AtomicU64,
    downloaded_bytes: AtomicU64,
    skipped: AtomicU64,
    added: AtomicU64,
    removed: AtomicU64,
    renamed: AtomicU64,
    overwritten: AtomicU64,
    errored: AtomicU64,
    merges: AtomicU64,
    branches_finished: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_fetched(&self) {
        self.0.fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.0.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_skipped(&self) {
        self.0.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_added(&self) {
        self.0.added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_removed(&self) {
        self.0.removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_renamed(&self) {
        self.0.renamed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_overwritten(&self) {
        self.0.overwritten.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_errored(&self) {
        self.0.errored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_merges(&self) {
        self.0.merges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_branches_finished(&self) {
        self.0.branches_finished.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let i = &*self.0;
        StatsSnapshot {
            fetched: i.fetched.load(Ordering::Relaxed),
            downloaded_bytes: i.downloaded_bytes.load(Ordering::Relaxed),
            skipped: i.skipped.load(Ordering::Relaxed),
            added: i.added.load(Ordering::Relaxed),
            removed: i.removed.load(Ordering::Relaxed),
            renamed: i.renamed.load(Ordering::Relaxed),
            overwritten: i.overwritten.load(Ordering::Relaxed),
            errored: i.errored.load(Ordering::Relaxed),
            merges: i.merges.load(Ordering::Relaxed),
            branches_finished: i.branches_finished.load(Ordering::Relaxed),
        }
    }
}

/// Immutable counter snapshot, reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub fetched: u64,
    pub downloaded_bytes: u64,
    pub skipped: u64,
    pub added: u64,
    pub removed: u64,
    pub renamed: u64,
    pub overwritten: u64,
    pub errored: u64,
    pub merges: u64,
    pub branches_finished: u64,
}

impl StatsSnapshot {
    /// True if any content-affecting counter is non-zero.
    pub fn any_changes(&self) -> bool {
        self.added + self.removed + self.renamed + self.overwritten > 0
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Only non-zero counters, in a stable order.
        let pairs = [
            ("fetched", self.fetched),
            ("downloaded_bytes", self.downloaded_bytes),
            ("added", self.added),
            ("overwritten", self.overwritten),
            ("renamed", self.renamed),
            ("removed", self.removed),
            ("skipped", self.skipped),
            ("errored", self.errored),
            ("merges", self.merges),
        ];
        let mut first = true;
        for (name, value) in pairs {
            if value == 0 {
                continue;
            }
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value}")?;
            first = false;
        }
        if first {
            write!(f, "no changes")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_across_clones() {
        let stats = Stats::new();
        let clone = stats.clone();

        stats.inc_added();
        clone.inc_added();
        clone.inc_skipped();
        clone.add_downloaded(512);

        let snap = stats.snapshot();
        assert_eq!(snap.added, 2);
        assert_eq!(snap.skipped, 1);
        assert_eq!(snap.downloaded_bytes, 512);
    }

    #[test]
    fn display_skips_zero_counters() {
        let stats = Stats::new();
        stats.inc_added();
        stats.inc_skipped();

        let text = stats.snapshot().to_string();
        assert_eq!(text, "added=1, skipped=1");
    }

    #[test]
    fn display_empty_run() {
        assert_eq!(Stats::new().snapshot().to_string(), "no changes");
    }

    #[test]
    fn any_changes_ignores_skips() {
        let stats = Stats::new();
        stats.inc_skipped();
        stats.inc_fetched();
        assert!(!stats.snapshot().any_changes());
        stats.inc_overwritten();
        assert!(stats.snapshot().any_changes());
    }
}
