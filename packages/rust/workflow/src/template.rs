//! The stock ingestion pipeline template and run entry point.
//!
//! `ingest_with_archives` wires the three-branch workflow around a
//! caller-supplied incoming sub-pipeline (the source-specific part):
//!
//! 1. switch to `incoming` (created from `master`'s tip on first run)
//! 2. run the incoming sub-pipeline; every sink commit lands on `incoming`
//! 3. apply the removal policy for URLs that disappeared upstream
//! 4. switch to `incoming-processed`; merge `incoming` with a
//!    "theirs"-biased, non-committing merge
//! 5. extract and reconcile archives over the merged tree
//! 6. switch to `master`; merge `incoming-processed` (unrelated histories
//!    allowed, `master` may carry human edits)
//! 7. finalize: flush commits, tag versions, clean up scratch files

use std::sync::Arc;

use tracing::{instrument, warn};

use alluvium_pipeline::{CancelToken, Executor, Record, StatsSnapshot, Tree, scoped, seq};
use alluvium_shared::{CrawlSpec, Result};
use alluvium_status::RemovalPolicy;
use alluvium_vcs::{MergeOptions, VersionedStore};

use crate::extract::ExtractConfig;
use crate::ingestor::{IngestOptions, Ingestor};
use crate::lock::RunLock;
use crate::{INCOMING, INCOMING_PROCESSED, MASTER};

/// Build the full three-branch tree around an incoming sub-pipeline. The
/// sub-pipeline must route its records into `ingestor.sink()`.
pub fn ingest_with_archives(
    ingestor: &Arc<Ingestor>,
    incoming: Tree,
    extract: ExtractConfig,
) -> Tree {
    seq([
        ingestor.switch_branch(INCOMING, Some(MASTER)),
        scoped(incoming),
        ingestor.remove_obsolete(),
        ingestor.switch_branch(INCOMING_PROCESSED, Some(MASTER)),
        scoped(seq([
            // Raw incoming always wins conflicts; the merge is committed
            // together with the extraction results. A no-op merge means an
            // unchanged source, so extraction is skipped entirely.
            ingestor.merge_branch(
                INCOMING,
                MergeOptions::default().theirs().no_commit(),
                true,
            ),
            ingestor.extract_archives(extract),
        ])),
        ingestor.switch_branch(MASTER, None),
        ingestor.merge_branch(
            INCOMING_PROCESSED,
            MergeOptions::default().allow_unrelated(),
            false,
        ),
        ingestor.finalize_node(true),
    ])
}

/// Derive ingestion options and extraction rules from a repository's crawl
/// spec (`.alluvium/crawl.toml`).
pub fn options_from_spec(spec: &CrawlSpec) -> Result<(IngestOptions, ExtractConfig)> {
    let opts = IngestOptions {
        stream: spec.pipeline.stream.clone(),
        removal: RemovalPolicy::parse(&spec.policies.removal)?,
        ..IngestOptions::default()
    };

    let params = &spec.pipeline.params;
    let mut extract = ExtractConfig::default();
    if let Some(v) = params.get("archive_regex").and_then(|v| v.as_str()) {
        extract.archive_regex = v.to_string();
    }
    if let Some(v) = params.get("archives_required").and_then(|v| v.as_bool()) {
        extract.required = v;
    }
    if let Some(v) = params.get("leading_dirs_depth").and_then(|v| v.as_integer()) {
        extract.strip_leading_dirs = v > 0;
        extract.leading_dirs_depth = v.max(0) as u32;
    }
    if let Some(v) = params.get("add_archive_leading_dir").and_then(|v| v.as_bool()) {
        extract.add_archive_leading_dir = v;
    }

    Ok((opts, extract))
}

/// Run one crawl against a repository.
///
/// Acquires the run lock (failing hard if another run is in progress),
/// builds the ingestor and the three-branch tree, and drives it to
/// completion. On any abort the working tree is restored, so branches are
/// left either pre-run or at the last cleanly committed state.
#[instrument(skip_all)]
pub async fn run_ingest<F>(
    store: Arc<dyn VersionedStore>,
    build_incoming: F,
    opts: IngestOptions,
    extract: ExtractConfig,
    cancel: CancelToken,
) -> Result<(Vec<Record>, StatsSnapshot)>
where
    F: FnOnce(&Arc<Ingestor>) -> Tree,
{
    let _lock = RunLock::acquire(store.workdir())?;

    let ingestor = Ingestor::new(store.clone(), opts)?;
    let incoming = build_incoming(&ingestor);
    let tree = ingest_with_archives(&ingestor, incoming, extract);

    let executor = Executor::with_cancel(cancel);
    match executor.run(&tree, Record::root()).await {
        Ok(result) => Ok(result),
        Err(err) => {
            if let Err(restore_err) = store.restore_worktree() {
                warn!(error = %restore_err, "failed to restore working tree after aborted run");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alluvium_pipeline::{emitting, leaf};
    use alluvium_vcs::MemoryStore;

    #[test]
    fn template_has_the_seven_stages() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn VersionedStore> =
            Arc::new(MemoryStore::new(dir.path().join("repo")).unwrap());
        let ingestor = Ingestor::new(store, IngestOptions::default()).unwrap();

        let incoming = leaf(emitting("noop", |r: Record| vec![r]));
        let tree = ingest_with_archives(&ingestor, incoming, ExtractConfig::default());

        // 8 workflow leaves plus the incoming sub-pipeline's own.
        assert_eq!(tree.len(), 9);
    }

    #[test]
    fn spec_parameters_reach_the_extract_config() {
        let toml_str = r#"
[pipeline]
template = "ingest-with-archives"
stream = "releases"

[pipeline.params]
archive_regex = '\.zip$'
archives_required = true
leading_dirs_depth = 0

[policies]
removal = "delete"
"#;
        let spec: CrawlSpec = toml::from_str(toml_str).unwrap();
        let (opts, extract) = options_from_spec(&spec).unwrap();

        assert_eq!(opts.stream, "releases");
        assert_eq!(opts.removal, RemovalPolicy::Delete);
        assert_eq!(extract.archive_regex, r"\.zip$");
        assert!(extract.required);
        assert!(!extract.strip_leading_dirs);
    }
}
