//! The ingestion sink and its branch-workflow nodes.
//!
//! One [`Ingestor`] instance owns the versioned store handle, the status
//! table, and the run-scoped state (candidates seen, files written, dataset
//! versions discovered). The instance itself is the terminal sink node —
//! intentionally shared across fan-out branches so all of them feed one
//! commit — and its factory methods hand out the branch-switch, merge,
//! removal, extraction and finalize nodes that pipeline templates compose
//! into the three-branch workflow.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use alluvium_pipeline::{Node, NodeOutput, NodeSignal, Record, Stats, Tree, leaf, shared};
use alluvium_shared::{AlluviumError, Fingerprint, METADATA_DIR, Result, TMP_DIR};
use alluvium_status::{Candidate, ChangeKind, RemovalPolicy, StatusDb};
use alluvium_vcs::{MergeOptions, MergeOutcome, VersionedStore};

use crate::extract::ExtractConfig;
use crate::{INCOMING_PROCESSED, MASTER, extract, versioning};

// ---------------------------------------------------------------------------
// Options & state
// ---------------------------------------------------------------------------

/// Per-pipeline ingestion policy.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Logical incoming-stream name; selects the status table file.
    pub stream: String,
    /// What happens to tracked files whose URL disappeared upstream.
    pub removal: RemovalPolicy,
    /// Path patterns handed to the store's large-file marking.
    pub large_patterns: Vec<String>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            stream: "default".to_string(),
            removal: RemovalPolicy::default(),
            large_patterns: vec!["*".to_string()],
        }
    }
}

struct IngestState {
    status: StatusDb,
    /// URLs seen this run (ingested or skipped), for removal detection.
    candidates: Vec<Candidate>,
    /// Files this run fetched individually, workdir-relative. The
    /// reconciliation step treats these as the "individual listing".
    fetched_files: Vec<String>,
    /// Dataset versions discovered during extraction, tagged on finalize.
    versions: BTreeSet<String>,
    /// Uncommitted changes are staged on the current branch.
    pending: bool,
}

// ---------------------------------------------------------------------------
// Ingestor
// ---------------------------------------------------------------------------

/// Shared sink committing fetched content into the versioned store.
pub struct Ingestor {
    store: Arc<dyn VersionedStore>,
    opts: IngestOptions,
    state: Mutex<IngestState>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn VersionedStore>, opts: IngestOptions) -> Result<Arc<Self>> {
        let status = StatusDb::open(store.workdir(), &opts.stream)?;
        store.mark_large(&opts.large_patterns)?;

        Ok(Arc::new(Self {
            store,
            opts,
            state: Mutex::new(IngestState {
                status,
                candidates: Vec::new(),
                fetched_files: Vec::new(),
                versions: BTreeSet::new(),
                pending: false,
            }),
        }))
    }

    pub fn store(&self) -> &Arc<dyn VersionedStore> {
        &self.store
    }

    fn lock(&self) -> MutexGuard<'_, IngestState> {
        self.state.lock().expect("ingest state poisoned")
    }

    /// Persist staged status updates and commit the working tree, so
    /// tracking state always rides the same commit as the content it
    /// describes. No-op when nothing is staged.
    fn commit_pending(&self, stats: &Stats) -> Result<()> {
        let mut state = self.lock();
        if !state.pending && !state.status.is_dirty() {
            return Ok(());
        }

        state.status.save()?;
        let message = format!("crawl update: {}", stats.snapshot());
        if let Some(id) = self.store.commit(&message)? {
            debug!(commit = &id[..12], "staged changes committed");
        }
        state.pending = false;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Node factories
    // -----------------------------------------------------------------------

    /// The terminal sink, as a shared tree leaf. Place it in as many
    /// branches as feed this repository.
    pub fn sink(self: &Arc<Self>) -> Tree {
        shared(self.clone())
    }

    /// Commit what is staged, then switch to `name` (creating it from
    /// `parent`'s tip if absent) and reload the branch-scoped status table.
    pub fn switch_branch(self: &Arc<Self>, name: &str, parent: Option<&str>) -> Tree {
        leaf(SwitchBranch {
            ingestor: self.clone(),
            label: format!("switch_branch({name})"),
            name: name.to_string(),
            parent: parent.map(str::to_string),
        })
    }

    /// Merge `source` into the current branch. With `skip_no_changes`, a
    /// no-op merge finishes the enclosing branch so dependent stages (e.g.
    /// extraction) are skipped entirely.
    pub fn merge_branch(
        self: &Arc<Self>,
        source: &str,
        opts: MergeOptions,
        skip_no_changes: bool,
    ) -> Tree {
        leaf(MergeBranch {
            ingestor: self.clone(),
            label: format!("merge_branch({source})"),
            source: source.to_string(),
            opts,
            skip_no_changes,
        })
    }

    /// Apply the removal policy to tracked URLs absent from this run's
    /// candidate set. Belongs at the end of the incoming sub-pipeline.
    pub fn remove_obsolete(self: &Arc<Self>) -> Tree {
        leaf(RemoveObsolete {
            ingestor: self.clone(),
        })
    }

    /// Run archive extraction and reconciliation over the working tree.
    pub fn extract_archives(self: &Arc<Self>, cfg: ExtractConfig) -> Tree {
        leaf(ExtractArchives {
            ingestor: self.clone(),
            cfg,
        })
    }

    /// Final stage: flush pending commits, tag dataset versions, verify
    /// branch-tip consistency, and optionally clean up scratch files.
    pub fn finalize_node(self: &Arc<Self>, cleanup: bool) -> Tree {
        leaf(Finalize {
            ingestor: self.clone(),
            cleanup,
        })
    }
}

/// Reject paths that would escape the working tree or collide with crawl
/// metadata.
fn sanitize_rel(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('/')
        || name.split('/').any(|c| c == "..")
        || name == METADATA_DIR
        || name.starts_with(&format!("{METADATA_DIR}/"));
    if bad {
        return Err(AlluviumError::validation(format!(
            "unsafe target filename {name:?}"
        )));
    }
    Ok(())
}

fn write_payload(workdir: &Path, rel: &str, bytes: &[u8]) -> Result<()> {
    let path = workdir.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| AlluviumError::io(parent, e))?;
    }
    std::fs::write(&path, bytes).map_err(|e| AlluviumError::io(&path, e))
}

// ---------------------------------------------------------------------------
// The sink node
// ---------------------------------------------------------------------------

#[async_trait]
impl Node for Ingestor {
    fn name(&self) -> &str {
        "ingest"
    }

    async fn process(&self, record: Record) -> NodeOutput {
        let filename = record
            .text("filename")
            .ok_or_else(|| AlluviumError::validation("ingest: record carries no `filename`"))?
            .to_string();
        sanitize_rel(&filename)?;

        let payload = record
            .blob("response")
            .ok_or_else(|| AlluviumError::validation("ingest: record carries no `response`"))?
            .clone();
        let fingerprint = Fingerprint::sha256_of(&payload);
        let url = record.text("url").map(str::to_string);

        let workdir = self.store.workdir().to_path_buf();
        let mut state = self.lock();

        let kind = match &url {
            Some(u) => state.status.classify(u, &fingerprint),
            // Untracked ingest (no URL): nothing to compare against.
            None => ChangeKind::New,
        };

        match kind {
            ChangeKind::Unchanged if workdir.join(&filename).exists() => {
                debug!(file = %filename, "content unchanged, skipping");
                record.stats().inc_skipped();
                if let Some(u) = &url {
                    state.status.revive(u);
                }
            }
            kind => {
                // Rename: the URL moved to a new target filename.
                let previous: Vec<String> = url
                    .as_deref()
                    .and_then(|u| state.status.get(u))
                    .map(|e| e.filenames.clone())
                    .unwrap_or_default();
                let renamed = !previous.is_empty() && !previous.contains(&filename);
                for old in previous {
                    if old != filename {
                        let old_path = workdir.join(&old);
                        if old_path.exists() {
                            std::fs::remove_file(&old_path)
                                .map_err(|e| AlluviumError::io(&old_path, e))?;
                        }
                    }
                }

                write_payload(&workdir, &filename, &payload)?;
                match kind {
                    ChangeKind::New => record.stats().inc_added(),
                    _ if renamed => record.stats().inc_renamed(),
                    ChangeKind::Changed => record.stats().inc_overwritten(),
                    // Tracked as unchanged but missing from the tree.
                    ChangeKind::Unchanged => record.stats().inc_added(),
                }
                if let Some(u) = &url {
                    state.status.record(u.clone(), fingerprint.clone(), &filename);
                }
                state.pending = true;
                debug!(file = %filename, ?kind, "payload ingested");
            }
        }

        if let Some(u) = url {
            state.candidates.push(Candidate {
                url: u,
                fingerprint,
            });
        }
        if !state.fetched_files.contains(&filename) {
            state.fetched_files.push(filename.clone());
        }
        drop(state);

        Ok(vec![record.with("path", filename)])
    }

    async fn finalize(&self, stats: &Stats) -> Result<()> {
        // Safety net for templates without an explicit finalize stage: a
        // batched sink must never leave staged content uncommitted.
        self.commit_pending(stats)
    }

    fn wants_finalize(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Branch nodes
// ---------------------------------------------------------------------------

struct SwitchBranch {
    ingestor: Arc<Ingestor>,
    label: String,
    name: String,
    parent: Option<String>,
}

#[async_trait]
impl Node for SwitchBranch {
    fn name(&self) -> &str {
        &self.label
    }

    async fn process(&self, record: Record) -> NodeOutput {
        self.ingestor.commit_pending(record.stats())?;

        let store = &self.ingestor.store;
        if store.current_branch()? != self.name {
            store.switch_branch(&self.name, self.parent.as_deref())?;
            // Status tables are branch-scoped files; pick up the one the
            // new branch carries.
            let root = store.workdir().to_path_buf();
            let mut state = self.ingestor.lock();
            state.status.reload(&root, &self.ingestor.opts.stream)?;
        }
        Ok(vec![record])
    }
}

struct MergeBranch {
    ingestor: Arc<Ingestor>,
    label: String,
    source: String,
    opts: MergeOptions,
    skip_no_changes: bool,
}

#[async_trait]
impl Node for MergeBranch {
    fn name(&self) -> &str {
        &self.label
    }

    async fn process(&self, record: Record) -> NodeOutput {
        self.ingestor.commit_pending(record.stats())?;

        match self.ingestor.store.merge(&self.source, &self.opts)? {
            MergeOutcome::Noop if self.skip_no_changes => {
                debug!(source = %self.source, "nothing to merge, finishing branch");
                Err(NodeSignal::FinishBranch)
            }
            MergeOutcome::Noop => Ok(vec![record]),
            MergeOutcome::Merged(id) => {
                debug!(source = %self.source, commit = &id[..12], "merged");
                record.stats().inc_merges();
                Ok(vec![record])
            }
            MergeOutcome::Staged => {
                record.stats().inc_merges();
                self.ingestor.lock().pending = true;
                Ok(vec![record])
            }
        }
    }
}

struct RemoveObsolete {
    ingestor: Arc<Ingestor>,
}

#[async_trait]
impl Node for RemoveObsolete {
    fn name(&self) -> &str {
        "remove_obsolete"
    }

    async fn process(&self, record: Record) -> NodeOutput {
        let workdir = self.ingestor.store.workdir().to_path_buf();
        let mut state = self.ingestor.lock();

        let removed = state.status.diff(&state.candidates).removed;
        for url in removed {
            match self.ingestor.opts.removal {
                RemovalPolicy::Delete => {
                    let Some(entry) = state.status.remove(&url) else {
                        continue;
                    };
                    for rel in entry.filenames {
                        let path = workdir.join(&rel);
                        if path.exists() {
                            std::fs::remove_file(&path)
                                .map_err(|e| AlluviumError::io(&path, e))?;
                        }
                    }
                    state.pending = true;
                    warn!(url = %url, "URL disappeared upstream, stored file deleted");
                    record.stats().inc_removed();
                }
                RemovalPolicy::MarkStale => {
                    // Already-stale entries were reported on an earlier run.
                    if state.status.get(&url).is_some_and(|e| e.stale) {
                        continue;
                    }
                    state.status.mark_stale(&url);
                    warn!(url = %url, "URL disappeared upstream, entry marked stale");
                    record.stats().inc_removed();
                }
            }
        }
        Ok(vec![record])
    }
}

struct ExtractArchives {
    ingestor: Arc<Ingestor>,
    cfg: ExtractConfig,
}

#[async_trait]
impl Node for ExtractArchives {
    fn name(&self) -> &str {
        "extract_archives"
    }

    async fn process(&self, record: Record) -> NodeOutput {
        let workdir = self.ingestor.store.workdir().to_path_buf();
        let individual = self.ingestor.lock().fetched_files.clone();

        let outcome = extract::reconcile_and_extract(&workdir, &self.cfg, &individual)?;
        if outcome.skipped {
            return Ok(vec![record]);
        }

        for _ in &outcome.extracted {
            record.stats().inc_added();
        }
        for _ in &outcome.dropped {
            record.stats().inc_removed();
        }
        for _ in &outcome.clashes {
            record.stats().inc_overwritten();
        }

        let mut state = self.ingestor.lock();
        state.versions.extend(outcome.versions.iter().cloned());
        state.pending = true;
        Ok(vec![record])
    }
}

struct Finalize {
    ingestor: Arc<Ingestor>,
    cleanup: bool,
}

#[async_trait]
impl Node for Finalize {
    fn name(&self) -> &str {
        "finalize"
    }

    async fn process(&self, record: Record) -> NodeOutput {
        let ing = &self.ingestor;
        ing.commit_pending(record.stats())?;

        let versions: Vec<String> = {
            let mut state = ing.lock();
            std::mem::take(&mut state.versions).into_iter().collect()
        };
        for version in &versions {
            versioning::apply_version_tag(ing.store.as_ref(), version)?;
        }

        // Branch tips must be consistent after every successful run.
        let store = &ing.store;
        if let (Some(master), Some(processed)) = (
            store.branch_tip(MASTER)?,
            store.branch_tip(INCOMING_PROCESSED)?,
        ) {
            if !store.is_ancestor(&processed, &master)? {
                warn!("incoming-processed tip is not contained in master after finalize");
            }
        }

        if self.cleanup {
            let tmp = store.workdir().join(METADATA_DIR).join(TMP_DIR);
            if tmp.exists() {
                std::fs::remove_dir_all(&tmp).map_err(|e| AlluviumError::io(&tmp, e))?;
            }
        }

        info!(summary = %record.stats().snapshot(), "run finalized");
        Ok(vec![record])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alluvium_vcs::MemoryStore;

    fn setup() -> (tempfile::TempDir, Arc<dyn VersionedStore>, Arc<Ingestor>) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn VersionedStore> =
            Arc::new(MemoryStore::new(dir.path().join("repo")).unwrap());
        let ingestor = Ingestor::new(store.clone(), IngestOptions::default()).unwrap();
        (dir, store, ingestor)
    }

    fn payload_record(url: &str, filename: &str, bytes: &[u8]) -> Record {
        Record::root()
            .with("url", url)
            .with("filename", filename)
            .with("response", bytes.to_vec())
    }

    #[tokio::test]
    async fn sink_adds_then_skips_unchanged() {
        let (_dir, store, ingestor) = setup();
        let rec = payload_record("https://x/f1", "f1.dat", b"one");

        let out = ingestor.process(rec.clone()).await.unwrap();
        assert_eq!(out[0].text("path"), Some("f1.dat"));
        assert!(store.workdir().join("f1.dat").exists());
        assert_eq!(rec.stats().snapshot().added, 1);

        // Same payload again: nothing written, skip counted.
        let rec2 = payload_record("https://x/f1", "f1.dat", b"one");
        ingestor.process(rec2.clone()).await.unwrap();
        assert_eq!(rec2.stats().snapshot().skipped, 1);
    }

    #[tokio::test]
    async fn sink_overwrites_changed_content() {
        let (_dir, store, ingestor) = setup();
        ingestor
            .process(payload_record("https://x/f1", "f1.dat", b"one"))
            .await
            .unwrap();

        let rec = payload_record("https://x/f1", "f1.dat", b"two");
        ingestor.process(rec.clone()).await.unwrap();
        assert_eq!(rec.stats().snapshot().overwritten, 1);
        assert_eq!(std::fs::read(store.workdir().join("f1.dat")).unwrap(), b"two");
    }

    #[tokio::test]
    async fn sink_renames_moved_target() {
        let (_dir, store, ingestor) = setup();
        ingestor
            .process(payload_record("https://x/f1", "old.dat", b"one"))
            .await
            .unwrap();

        let rec = payload_record("https://x/f1", "new.dat", b"two");
        ingestor.process(rec.clone()).await.unwrap();
        assert_eq!(rec.stats().snapshot().renamed, 1);
        assert!(!store.workdir().join("old.dat").exists());
        assert!(store.workdir().join("new.dat").exists());
    }

    #[tokio::test]
    async fn sink_rejects_escaping_paths() {
        let (_dir, _store, ingestor) = setup();
        let rec = payload_record("https://x/f1", "../escape", b"one");
        assert!(matches!(
            ingestor.process(rec).await,
            Err(NodeSignal::Abort(_))
        ));

        let rec = payload_record("https://x/f1", ".alluvium/status/default.json", b"x");
        assert!(matches!(
            ingestor.process(rec).await,
            Err(NodeSignal::Abort(_))
        ));
    }

    #[tokio::test]
    async fn remove_obsolete_deletes_with_policy() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn VersionedStore> =
            Arc::new(MemoryStore::new(dir.path().join("repo")).unwrap());
        let ingestor = Ingestor::new(
            store.clone(),
            IngestOptions {
                removal: RemovalPolicy::Delete,
                ..IngestOptions::default()
            },
        )
        .unwrap();

        // Run 1 ingests A and B.
        for (url, file) in [("https://x/a", "a.dat"), ("https://x/b", "b.dat")] {
            ingestor
                .process(payload_record(url, file, b"payload"))
                .await
                .unwrap();
        }
        // Candidate set for this run only re-lists A.
        {
            let mut state = ingestor.lock();
            state.candidates.retain(|c| c.url == "https://x/a");
        }

        let node = RemoveObsolete {
            ingestor: ingestor.clone(),
        };
        let rec = Record::root();
        node.process(rec.clone()).await.unwrap();

        assert_eq!(rec.stats().snapshot().removed, 1);
        assert!(!store.workdir().join("b.dat").exists());
        assert!(ingestor.lock().status.get("https://x/b").is_none());
    }
}
