//! Minimal contract for the versioned content store the workflow engine
//! drives.
//!
//! The actual storage engine is an external service; this crate only pins
//! down what the ingestion state machine needs from it: named branches,
//! atomic working-tree commits, biased merges, tags, commit enumeration,
//! path-level diffs, ancestry tests, and large-file marking. The bundled
//! [`MemoryStore`] is an in-process reference backend used by the test
//! suite and by embedders who bring no real store.

pub mod memory;

use std::path::Path;

use alluvium_shared::Result;

pub use memory::MemoryStore;

/// Opaque commit identifier.
pub type CommitId = String;

// ---------------------------------------------------------------------------
// Merge types
// ---------------------------------------------------------------------------

/// How file-level conflicts are resolved during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Conflicting changes on both sides are an error.
    #[default]
    Strict,
    /// The source branch wins every conflict. Used when merging `incoming`
    /// into `incoming-processed`, so binary content never blocks a merge.
    Theirs,
}

/// Options for [`VersionedStore::merge`].
#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub strategy: MergeStrategy,
    /// When false, the merged tree is left in the working tree and the next
    /// commit records the merge parentage.
    pub commit: bool,
    /// Permit merging branches that share no common ancestor (`master` may
    /// carry independent human edits).
    pub allow_unrelated: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::Strict,
            commit: true,
            allow_unrelated: false,
        }
    }
}

impl MergeOptions {
    #[must_use]
    pub fn theirs(mut self) -> Self {
        self.strategy = MergeStrategy::Theirs;
        self
    }

    #[must_use]
    pub fn no_commit(mut self) -> Self {
        self.commit = false;
        self
    }

    #[must_use]
    pub fn allow_unrelated(mut self) -> Self {
        self.allow_unrelated = true;
        self
    }
}

/// Result of a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Source is already contained in the target; nothing happened.
    Noop,
    /// A merge commit was created on the current branch.
    Merged(CommitId),
    /// The merged tree was written to the working tree; the next commit
    /// will carry the merge parentage.
    Staged,
}

// ---------------------------------------------------------------------------
// Diff types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One path-level change between two commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathChange {
    pub path: String,
    pub kind: ChangeKind,
}

// ---------------------------------------------------------------------------
// The store contract
// ---------------------------------------------------------------------------

/// What the ingestion workflow requires of a versioned content store.
///
/// All operations assume exclusive access to the working tree; callers
/// serialize runs via the workflow run lock.
pub trait VersionedStore: Send + Sync {
    /// The working tree nodes read and write files in.
    fn workdir(&self) -> &Path;

    fn current_branch(&self) -> Result<String>;

    fn has_branch(&self, name: &str) -> Result<bool>;

    /// Switch to `name`, creating it from `parent`'s tip (or the current
    /// branch's tip when `None`) if it does not exist. Fails if the working
    /// tree has uncommitted changes.
    fn switch_branch(&self, name: &str, parent: Option<&str>) -> Result<()>;

    /// Atomically commit the working-tree snapshot. Returns `None` when the
    /// tree is identical to the branch tip and no merge is pending.
    fn commit(&self, message: &str) -> Result<Option<CommitId>>;

    /// Merge `source` into the current branch.
    fn merge(&self, source: &str, opts: &MergeOptions) -> Result<MergeOutcome>;

    /// Discard uncommitted working-tree changes (including a staged merge)
    /// and rematerialize the current branch tip. Used after an aborted run
    /// so branches are left exactly as they were before it.
    fn restore_worktree(&self) -> Result<()>;

    /// Tag the current branch tip. Fails if the tag already exists.
    fn tag(&self, name: &str, message: &str) -> Result<()>;

    fn tag_target(&self, name: &str) -> Result<Option<CommitId>>;

    fn branch_tip(&self, branch: &str) -> Result<Option<CommitId>>;

    /// Commits reachable from a branch tip, tip first.
    fn log(&self, branch: &str) -> Result<Vec<CommitId>>;

    /// Path-level changes going from commit `from` to commit `to`.
    fn diff(&self, from: &CommitId, to: &CommitId) -> Result<Vec<PathChange>>;

    /// Whether `ancestor` is reachable from `descendant` (a commit counts
    /// as its own ancestor).
    fn is_ancestor(&self, ancestor: &CommitId, descendant: &CommitId) -> Result<bool>;

    /// Mark paths matching the given patterns as large/externally stored.
    fn mark_large(&self, patterns: &[String]) -> Result<()>;
}
