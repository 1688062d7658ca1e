//! Three-branch ingestion workflow for alluvium.
//!
//! Crawled content flows through three named branches of the versioned
//! store: `incoming` (verbatim fetched content, one commit per run),
//! `incoming-processed` (deterministic extraction/reconciliation of
//! `incoming`), and `master` (stable published view, advanced only by
//! merging `incoming-processed`).
//!
//! This crate provides:
//! - [`Ingestor`] — the shared ingestion sink and its branch nodes
//! - [`extract`] — archive extraction and canonical/individual reconciliation
//! - [`versioning`] — dataset version tagging
//! - [`RunLock`] — hard mutual exclusion between runs
//! - [`ingest_with_archives`] / [`run_ingest`] — the stock pipeline template

pub mod extract;
pub mod ingestor;
pub mod lock;
pub mod template;
pub mod versioning;

/// Stable published branch; only advanced by merges, never edited directly
/// by the crawler.
pub const MASTER: &str = "master";

/// Branch receiving verbatim fetched content, one commit per crawl run.
/// Always branched from `master`'s tip.
pub const INCOMING: &str = "incoming";

/// Branch holding the deterministic extraction of `incoming`. May be
/// regenerated at any time from `incoming` plus the extraction ruleset.
pub const INCOMING_PROCESSED: &str = "incoming-processed";

pub use extract::{DEFAULT_ARCHIVE_REGEX, ExtractConfig, ExtractOutcome, reconcile_and_extract};
pub use ingestor::{IngestOptions, Ingestor};
pub use lock::{RUN_LOCK_REL, RunLock};
pub use template::{ingest_with_archives, options_from_spec, run_ingest};
pub use versioning::apply_version_tag;
