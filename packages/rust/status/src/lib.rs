//! Per-URL status tracking for incremental, idempotent crawling.
//!
//! The [`StatusDb`] is a versioned key-value table mapping each source URL
//! to its last-seen content fingerprint and target filename(s). It is the
//! sole mechanism by which a re-crawl decides "changed / new / unchanged /
//! removed": if fingerprints match, nothing is downloaded and nothing is
//! committed.
//!
//! One JSON file per logical incoming stream lives at
//! `.alluvium/status/<stream>.json` inside the repository working tree, so
//! status is branch-scoped and travels with commits. Writes are staged in
//! memory and flushed atomically by [`StatusDb::save`], which the workflow
//! engine calls right before the branch commit that carries them.

mod migrations;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use alluvium_shared::{AlluviumError, Fingerprint, METADATA_DIR, Result, STATUS_DIR};

pub use migrations::CURRENT_STATUS_SCHEMA;

// ---------------------------------------------------------------------------
// Entry & diff types
// ---------------------------------------------------------------------------

/// One tracked URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    /// Last-seen content fingerprint.
    pub fingerprint: Fingerprint,
    /// Target filename(s) this URL was stored under.
    pub filenames: Vec<String>,
    /// When the entry was last recorded after a successful ingest. Not
    /// refreshed on unchanged re-crawls, so an idempotent run rewrites
    /// nothing.
    pub last_modified: DateTime<Utc>,
    /// Set when the URL disappeared upstream and the removal policy keeps
    /// the file around.
    #[serde(default)]
    pub stale: bool,
}

/// On-disk file layout.
#[derive(Debug, Serialize, Deserialize)]
struct StatusFile {
    schema_version: u32,
    entries: BTreeMap<String, StatusEntry>,
}

/// How a candidate URL relates to the tracked state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    New,
    Changed,
    Unchanged,
}

/// A URL offered by the current crawl, with its content fingerprint.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub url: String,
    pub fingerprint: Fingerprint,
}

/// Classification of a full candidate set against the tracked state.
#[derive(Debug, Default, PartialEq)]
pub struct UrlDiff {
    /// URLs never seen before.
    pub new: Vec<String>,
    /// Tracked URLs whose fingerprint differs.
    pub changed: Vec<String>,
    /// Tracked URLs whose fingerprint matches.
    pub unchanged: Vec<String>,
    /// Previously tracked URLs absent from the candidate set.
    pub removed: Vec<String>,
}

/// What to do with tracked files whose URL disappeared upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemovalPolicy {
    /// Keep the stored file, mark the entry stale.
    #[default]
    MarkStale,
    /// Delete the stored file and drop the entry.
    Delete,
}

impl RemovalPolicy {
    /// Parse the `policies.removal` config value.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "mark-stale" => Ok(Self::MarkStale),
            "delete" => Ok(Self::Delete),
            other => Err(AlluviumError::config(format!(
                "unknown removal policy {other:?} (expected \"mark-stale\" or \"delete\")"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// StatusDb
// ---------------------------------------------------------------------------

/// In-memory view of one stream's status table, loaded from and saved to
/// the repository working tree.
#[derive(Debug)]
pub struct StatusDb {
    path: PathBuf,
    entries: BTreeMap<String, StatusEntry>,
    dirty: bool,
}

/// Path of a stream's status file inside a repository working tree.
pub fn status_path(repo_root: &Path, stream: &str) -> PathBuf {
    repo_root
        .join(METADATA_DIR)
        .join(STATUS_DIR)
        .join(format!("{stream}.json"))
}

impl StatusDb {
    /// Load the status table for `stream`, or start empty if the file does
    /// not exist yet.
    ///
    /// A file that exists but cannot be read or parsed is a hard error —
    /// tracking state is never silently dropped. The error names the
    /// explicit [`StatusDb::repair`] path.
    pub fn open(repo_root: &Path, stream: &str) -> Result<Self> {
        let path = status_path(repo_root, stream);

        if !path.exists() {
            debug!(?path, "no status file yet, starting empty");
            return Ok(Self {
                path,
                entries: BTreeMap::new(),
                dirty: false,
            });
        }

        let content = std::fs::read_to_string(&path).map_err(|e| AlluviumError::io(&path, e))?;
        let raw: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
            AlluviumError::Status(format!(
                "corrupt status file {}: {e}; refusing to continue — \
                 use repair() to reset tracking explicitly",
                path.display()
            ))
        })?;

        let file = migrations::upgrade(raw, &path)?;
        Ok(Self {
            path,
            entries: file.entries,
            dirty: false,
        })
    }

    /// Reset a corrupt status table, preserving the old file under a
    /// `.corrupt` suffix. Every repair is logged; it is never automatic.
    pub fn repair(repo_root: &Path, stream: &str) -> Result<Self> {
        let path = status_path(repo_root, stream);
        if path.exists() {
            let backup = path.with_extension("json.corrupt");
            std::fs::rename(&path, &backup).map_err(|e| AlluviumError::io(&path, e))?;
            warn!(?path, ?backup, "status table reset, previous content preserved");
        }
        Ok(Self {
            path,
            entries: BTreeMap::new(),
            dirty: true,
        })
    }

    /// Classify one candidate against the tracked state.
    pub fn classify(&self, url: &str, fingerprint: &Fingerprint) -> ChangeKind {
        match self.entries.get(url) {
            None => ChangeKind::New,
            Some(entry) if &entry.fingerprint == fingerprint => ChangeKind::Unchanged,
            Some(_) => ChangeKind::Changed,
        }
    }

    /// Classify a full candidate set: {new, changed, unchanged, removed}.
    ///
    /// `removed` is the set of previously known URLs absent from the
    /// candidates.
    pub fn diff(&self, candidates: &[Candidate]) -> UrlDiff {
        let mut diff = UrlDiff::default();

        for candidate in candidates {
            match self.classify(&candidate.url, &candidate.fingerprint) {
                ChangeKind::New => diff.new.push(candidate.url.clone()),
                ChangeKind::Changed => diff.changed.push(candidate.url.clone()),
                ChangeKind::Unchanged => diff.unchanged.push(candidate.url.clone()),
            }
        }

        let candidate_urls: std::collections::HashSet<&str> =
            candidates.iter().map(|c| c.url.as_str()).collect();
        for url in self.entries.keys() {
            if !candidate_urls.contains(url.as_str()) {
                diff.removed.push(url.clone());
            }
        }

        diff
    }

    pub fn get(&self, url: &str) -> Option<&StatusEntry> {
        self.entries.get(url)
    }

    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// All filenames currently tracked, across every URL.
    pub fn tracked_filenames(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .values()
            .flat_map(|e| e.filenames.iter().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stage a successful ingest: the URL now maps to this fingerprint and
    /// target filename.
    pub fn record(&mut self, url: impl Into<String>, fingerprint: Fingerprint, filename: &str) {
        self.entries.insert(
            url.into(),
            StatusEntry {
                fingerprint,
                filenames: vec![filename.to_string()],
                last_modified: Utc::now(),
                stale: false,
            },
        );
        self.dirty = true;
    }

    /// Clear the stale flag on an entry whose content reappeared upstream.
    /// A no-op (and no rewrite) when the entry was never stale.
    pub fn revive(&mut self, url: &str) {
        if let Some(entry) = self.entries.get_mut(url) {
            if entry.stale {
                entry.stale = false;
                self.dirty = true;
            }
        }
    }

    /// Mark a disappeared URL stale (keep the file, remember the state).
    /// Only dirties the table when the flag actually flips.
    pub fn mark_stale(&mut self, url: &str) -> bool {
        match self.entries.get_mut(url) {
            Some(entry) => {
                if !entry.stale {
                    entry.stale = true;
                    self.dirty = true;
                }
                true
            }
            None => false,
        }
    }

    /// Drop a URL from tracking, returning its entry.
    pub fn remove(&mut self, url: &str) -> Option<StatusEntry> {
        let entry = self.entries.remove(url);
        if entry.is_some() {
            self.dirty = true;
        }
        entry
    }

    /// Persist atomically (write-temp-then-rename). The caller commits the
    /// branch right after, so tracking state and content always land in the
    /// same commit — or not at all.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AlluviumError::io(parent, e))?;
        }

        let file = StatusFile {
            schema_version: CURRENT_STATUS_SCHEMA,
            entries: self.entries.clone(),
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| AlluviumError::Status(format!("serialize status table: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| AlluviumError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| AlluviumError::io(&self.path, e))?;

        debug!(path = ?self.path, entries = self.entries.len(), "status table saved");
        self.dirty = false;
        Ok(())
    }

    /// Forget in-memory state and re-read from disk. Used after branch
    /// switches, since the file's content is branch-scoped.
    pub fn reload(&mut self, repo_root: &Path, stream: &str) -> Result<()> {
        *self = Self::open(repo_root, stream)?;
        Ok(())
    }
}
