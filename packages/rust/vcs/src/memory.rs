//! In-process reference implementation of [`VersionedStore`].
//!
//! Branches are a DAG of path→bytes snapshots kept in memory; the working
//! tree is a real directory materialized on every branch switch, so nodes
//! that extract archives or write fetched payloads operate on actual files.
//! Not a persistence layer: state lives as long as the store value.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tracing::debug;

use alluvium_shared::{AlluviumError, Result};

use crate::{
    ChangeKind, CommitId, MergeOptions, MergeOutcome, MergeStrategy, PathChange, VersionedStore,
};

/// Relative path → file bytes. Paths use `/` separators.
type Snapshot = BTreeMap<String, Arc<[u8]>>;

#[derive(Clone)]
struct CommitData {
    parents: Vec<CommitId>,
    message: String,
    files: Snapshot,
}

struct Inner {
    commits: HashMap<CommitId, CommitData>,
    branches: BTreeMap<String, CommitId>,
    tags: BTreeMap<String, CommitId>,
    head: String,
    /// Set by a no-commit merge; consumed by the next commit as its second
    /// parent.
    pending_merge: Option<CommitId>,
    large_patterns: Vec<String>,
}

/// In-memory [`VersionedStore`] over a real working directory.
pub struct MemoryStore {
    workdir: PathBuf,
    /// Relative paths excluded from snapshots and preserved on checkout
    /// (e.g. the run lock file).
    ignores: Vec<String>,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Open a store over `workdir` (created if absent). The initial commit
    /// on `master` captures whatever the directory already contains.
    pub fn new(workdir: impl Into<PathBuf>) -> Result<Self> {
        let workdir = workdir.into();
        std::fs::create_dir_all(&workdir).map_err(|e| AlluviumError::io(&workdir, e))?;

        let store = Self {
            workdir,
            ignores: Vec::new(),
            inner: Mutex::new(Inner {
                commits: HashMap::new(),
                branches: BTreeMap::new(),
                tags: BTreeMap::new(),
                head: "master".to_string(),
                pending_merge: None,
                large_patterns: Vec::new(),
            }),
        };

        let files = store.snapshot_workdir()?;
        let root = CommitData {
            parents: Vec::new(),
            message: "initial".to_string(),
            files,
        };
        let id = commit_id(&root);
        {
            let mut inner = store.inner.lock().expect("store lock poisoned");
            inner.commits.insert(id.clone(), root);
            inner.branches.insert("master".to_string(), id);
        }
        Ok(store)
    }

    /// Exclude a relative path from version tracking.
    #[must_use]
    pub fn ignore(mut self, rel: impl Into<String>) -> Self {
        self.ignores.push(rel.into());
        self
    }

    /// Patterns registered through [`VersionedStore::mark_large`].
    pub fn large_patterns(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .large_patterns
            .clone()
    }

    /// Relative paths recorded in a commit, sorted.
    pub fn paths_at(&self, commit: &CommitId) -> Result<Vec<String>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let data = lookup(&inner.commits, commit)?;
        Ok(data.files.keys().cloned().collect())
    }

    /// Bytes of one file in a commit.
    pub fn file_at(&self, commit: &CommitId, path: &str) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let data = lookup(&inner.commits, commit)?;
        Ok(data.files.get(path).map(|b| b.to_vec()))
    }

    // -----------------------------------------------------------------------
    // Working tree
    // -----------------------------------------------------------------------

    fn snapshot_workdir(&self) -> Result<Snapshot> {
        let mut files = Snapshot::new();
        for rel in walk(&self.workdir)? {
            if self.ignores.iter().any(|i| i == &rel) {
                continue;
            }
            let path = self.workdir.join(&rel);
            let bytes = std::fs::read(&path).map_err(|e| AlluviumError::io(&path, e))?;
            files.insert(rel, Arc::from(bytes));
        }
        Ok(files)
    }

    fn checkout(&self, files: &Snapshot) -> Result<()> {
        // Drop everything tracked, keep ignored paths in place.
        for rel in walk(&self.workdir)? {
            if self.ignores.iter().any(|i| i == &rel) {
                continue;
            }
            let path = self.workdir.join(&rel);
            std::fs::remove_file(&path).map_err(|e| AlluviumError::io(&path, e))?;
        }
        remove_empty_dirs(&self.workdir)?;

        for (rel, bytes) in files {
            let path = self.workdir.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| AlluviumError::io(parent, e))?;
            }
            std::fs::write(&path, bytes).map_err(|e| AlluviumError::io(&path, e))?;
        }
        Ok(())
    }

    fn assert_clean(&self, inner: &Inner) -> Result<()> {
        let tip = tip_of(inner, &inner.head)?;
        let tip_files = &inner.commits[&tip].files;
        if inner.pending_merge.is_some() || self.snapshot_workdir()? != *tip_files {
            return Err(AlluviumError::Store(format!(
                "working tree on {:?} has uncommitted changes; commit before switching",
                inner.head
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

fn commit_id(data: &CommitData) -> CommitId {
    let mut hasher = Sha256::new();
    hasher.update(data.message.as_bytes());
    for parent in &data.parents {
        hasher.update(b"\0parent\0");
        hasher.update(parent.as_bytes());
    }
    for (path, bytes) in &data.files {
        hasher.update(b"\0file\0");
        hasher.update(path.as_bytes());
        hasher.update(b"\0");
        hasher.update(bytes);
    }
    format!("{:x}", hasher.finalize())
}

fn lookup<'a>(
    commits: &'a HashMap<CommitId, CommitData>,
    id: &CommitId,
) -> Result<&'a CommitData> {
    commits
        .get(id)
        .ok_or_else(|| AlluviumError::Store(format!("unknown commit {id}")))
}

fn tip_of(inner: &Inner, branch: &str) -> Result<CommitId> {
    inner
        .branches
        .get(branch)
        .cloned()
        .ok_or_else(|| AlluviumError::Store(format!("unknown branch {branch:?}")))
}

/// All relative file paths under `root`, `/`-separated, sorted.
fn walk(root: &Path) -> Result<Vec<String>> {
    fn visit(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        let entries = std::fs::read_dir(dir).map_err(|e| AlluviumError::io(dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| AlluviumError::io(dir, e))?;
            let path = entry.path();
            if path.is_dir() {
                visit(root, &path, out)?;
            } else {
                let rel = path
                    .strip_prefix(root)
                    .expect("walked path is below root")
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(rel);
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    visit(root, root, &mut out)?;
    out.sort();
    Ok(out)
}

fn remove_empty_dirs(root: &Path) -> Result<()> {
    fn visit(dir: &Path, is_root: bool) -> Result<bool> {
        let mut empty = true;
        let entries = std::fs::read_dir(dir).map_err(|e| AlluviumError::io(dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| AlluviumError::io(dir, e))?;
            let path = entry.path();
            if path.is_dir() {
                if !visit(&path, false)? {
                    empty = false;
                }
            } else {
                empty = false;
            }
        }
        if empty && !is_root {
            // May race with ignored files; best effort only.
            let _ = std::fs::remove_dir(dir);
            return Ok(std::fs::metadata(dir).is_err());
        }
        Ok(false)
    }

    visit(root, true).map(|_| ())
}

fn ancestors(commits: &HashMap<CommitId, CommitData>, from: &CommitId) -> HashSet<CommitId> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([from.clone()]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        if let Some(data) = commits.get(&id) {
            queue.extend(data.parents.iter().cloned());
        }
    }
    seen
}

/// Best common ancestor: a shared ancestor that is not an ancestor of any
/// other shared ancestor.
fn merge_base(
    commits: &HashMap<CommitId, CommitData>,
    a: &CommitId,
    b: &CommitId,
) -> Option<CommitId> {
    let shared: Vec<CommitId> = ancestors(commits, a)
        .intersection(&ancestors(commits, b))
        .cloned()
        .collect();

    shared
        .iter()
        .find(|c| {
            shared
                .iter()
                .all(|other| other == *c || !ancestors(commits, other).contains(*c))
        })
        .cloned()
}

fn three_way(
    base: &Snapshot,
    target: &Snapshot,
    source: &Snapshot,
    strategy: MergeStrategy,
) -> Result<Snapshot> {
    let mut paths: HashSet<&String> = HashSet::new();
    paths.extend(base.keys());
    paths.extend(target.keys());
    paths.extend(source.keys());

    let mut merged = Snapshot::new();
    for path in paths {
        let b = base.get(path);
        let t = target.get(path);
        let s = source.get(path);

        let source_changed = s != b;
        let target_changed = t != b;

        let keep = match (source_changed, target_changed) {
            (false, _) => t,
            (true, false) => s,
            (true, true) if s == t => t,
            (true, true) => match strategy {
                MergeStrategy::Theirs => s,
                MergeStrategy::Strict => {
                    return Err(AlluviumError::Store(format!(
                        "merge conflict at {path:?}"
                    )));
                }
            },
        };
        if let Some(bytes) = keep {
            merged.insert(path.clone(), bytes.clone());
        }
    }
    Ok(merged)
}

// ---------------------------------------------------------------------------
// VersionedStore impl
// ---------------------------------------------------------------------------

impl VersionedStore for MemoryStore {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn current_branch(&self) -> Result<String> {
        Ok(self.inner.lock().expect("store lock poisoned").head.clone())
    }

    fn has_branch(&self, name: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .expect("store lock poisoned")
            .branches
            .contains_key(name))
    }

    fn switch_branch(&self, name: &str, parent: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if inner.head == name && inner.branches.contains_key(name) {
            return Ok(());
        }
        self.assert_clean(&inner)?;

        let tip = if inner.branches.contains_key(name) {
            inner.branches[name].clone()
        } else {
            let parent_branch = parent.unwrap_or(&inner.head).to_string();
            let parent_tip = tip_of(&inner, &parent_branch)?;
            debug!(branch = name, parent = %parent_branch, "creating branch");
            inner.branches.insert(name.to_string(), parent_tip.clone());
            parent_tip
        };

        let files = inner.commits[&tip].files.clone();
        inner.head = name.to_string();
        drop(inner);
        self.checkout(&files)
    }

    fn commit(&self, message: &str) -> Result<Option<CommitId>> {
        let files = self.snapshot_workdir()?;
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let tip = tip_of(&inner, &inner.head)?;

        let unchanged = inner.commits[&tip].files == files;
        if unchanged && inner.pending_merge.is_none() {
            return Ok(None);
        }

        let mut parents = vec![tip];
        if let Some(merge_parent) = inner.pending_merge.take() {
            parents.push(merge_parent);
        }

        let data = CommitData {
            parents,
            message: message.to_string(),
            files,
        };
        let id = commit_id(&data);
        debug!(branch = %inner.head, commit = &id[..12], "committed");
        inner.commits.insert(id.clone(), data);
        let head = inner.head.clone();
        inner.branches.insert(head, id.clone());
        Ok(Some(id))
    }

    fn merge(&self, source: &str, opts: &MergeOptions) -> Result<MergeOutcome> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let target_tip = tip_of(&inner, &inner.head)?;
        let source_tip = tip_of(&inner, source)?;

        let anc = ancestors(&inner.commits, &target_tip);
        if anc.contains(&source_tip) {
            return Ok(MergeOutcome::Noop);
        }

        let base = merge_base(&inner.commits, &target_tip, &source_tip);
        if base.is_none() && !opts.allow_unrelated {
            return Err(AlluviumError::Store(format!(
                "refusing to merge unrelated history of {source:?} into {:?}",
                inner.head
            )));
        }

        let empty = Snapshot::new();
        let base_files = base
            .as_ref()
            .map(|id| &inner.commits[id].files)
            .unwrap_or(&empty);
        let merged = three_way(
            base_files,
            &inner.commits[&target_tip].files,
            &inner.commits[&source_tip].files,
            opts.strategy,
        )?;

        if opts.commit {
            let data = CommitData {
                parents: vec![target_tip, source_tip],
                message: format!("merge {source} into {}", inner.head),
                files: merged.clone(),
            };
            let id = commit_id(&data);
            inner.commits.insert(id.clone(), data);
            let head = inner.head.clone();
            inner.branches.insert(head, id.clone());
            drop(inner);
            self.checkout(&merged)?;
            Ok(MergeOutcome::Merged(id))
        } else {
            inner.pending_merge = Some(source_tip);
            drop(inner);
            self.checkout(&merged)?;
            Ok(MergeOutcome::Staged)
        }
    }

    fn restore_worktree(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.pending_merge = None;
        let tip = tip_of(&inner, &inner.head)?;
        let files = inner.commits[&tip].files.clone();
        drop(inner);
        self.checkout(&files)
    }

    fn tag(&self, name: &str, message: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if inner.tags.contains_key(name) {
            return Err(AlluviumError::Store(format!("tag {name:?} already exists")));
        }
        let tip = tip_of(&inner, &inner.head)?;
        debug!(tag = name, commit = &tip[..12], message, "tagged");
        inner.tags.insert(name.to_string(), tip);
        Ok(())
    }

    fn tag_target(&self, name: &str) -> Result<Option<CommitId>> {
        Ok(self
            .inner
            .lock()
            .expect("store lock poisoned")
            .tags
            .get(name)
            .cloned())
    }

    fn branch_tip(&self, branch: &str) -> Result<Option<CommitId>> {
        Ok(self
            .inner
            .lock()
            .expect("store lock poisoned")
            .branches
            .get(branch)
            .cloned())
    }

    fn log(&self, branch: &str) -> Result<Vec<CommitId>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let tip = tip_of(&inner, branch)?;

        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([tip]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(data) = inner.commits.get(&id) {
                queue.extend(data.parents.iter().cloned());
            }
            out.push(id);
        }
        Ok(out)
    }

    fn diff(&self, from: &CommitId, to: &CommitId) -> Result<Vec<PathChange>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let from_files = &lookup(&inner.commits, from)?.files;
        let to_files = &lookup(&inner.commits, to)?.files;

        let mut changes = Vec::new();
        for (path, bytes) in to_files.iter() {
            match from_files.get(path) {
                None => changes.push(PathChange {
                    path: path.clone(),
                    kind: ChangeKind::Added,
                }),
                Some(old) if old != bytes => changes.push(PathChange {
                    path: path.clone(),
                    kind: ChangeKind::Modified,
                }),
                Some(_) => {}
            }
        }
        for path in from_files.keys() {
            if !to_files.contains_key(path) {
                changes.push(PathChange {
                    path: path.clone(),
                    kind: ChangeKind::Removed,
                });
            }
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }

    fn is_ancestor(&self, ancestor: &CommitId, descendant: &CommitId) -> Result<bool> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(ancestors(&inner.commits, descendant).contains(ancestor))
    }

    fn mark_large(&self, patterns: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        for pattern in patterns {
            if !inner.large_patterns.contains(pattern) {
                inner.large_patterns.push(pattern.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(store: &MemoryStore, rel: &str, bytes: &[u8]) {
        let path = store.workdir().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    fn store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path().join("repo")).unwrap();
        (dir, store)
    }

    #[test]
    fn commit_is_idempotent_on_unchanged_tree() {
        let (_dir, store) = store();
        write(&store, "a.txt", b"one");

        let first = store.commit("add a").unwrap();
        assert!(first.is_some());
        assert_eq!(store.commit("again").unwrap(), None);
    }

    #[test]
    fn branch_created_from_parent_tip() {
        let (_dir, store) = store();
        write(&store, "a.txt", b"one");
        store.commit("add a").unwrap();
        let master_tip = store.branch_tip("master").unwrap().unwrap();

        store.switch_branch("incoming", Some("master")).unwrap();
        assert_eq!(store.current_branch().unwrap(), "incoming");
        assert_eq!(store.branch_tip("incoming").unwrap().unwrap(), master_tip);
        // Working tree materialized from the parent tip.
        assert_eq!(
            std::fs::read(store.workdir().join("a.txt")).unwrap(),
            b"one"
        );
    }

    #[test]
    fn switch_with_dirty_tree_fails() {
        let (_dir, store) = store();
        write(&store, "a.txt", b"one");
        let err = store.switch_branch("incoming", None).expect_err("dirty");
        assert!(err.to_string().contains("uncommitted"));
    }

    #[test]
    fn theirs_merge_takes_source_conflicts() {
        let (_dir, store) = store();
        write(&store, "shared.txt", b"base");
        store.commit("base").unwrap();

        store.switch_branch("incoming", None).unwrap();
        write(&store, "shared.txt", b"from incoming");
        write(&store, "new.txt", b"fresh");
        store.commit("incoming work").unwrap();

        store.switch_branch("master", None).unwrap();
        write(&store, "shared.txt", b"from master");
        store.commit("master work").unwrap();

        let outcome = store
            .merge("incoming", &MergeOptions::default().theirs())
            .unwrap();
        assert!(matches!(outcome, MergeOutcome::Merged(_)));
        assert_eq!(
            std::fs::read(store.workdir().join("shared.txt")).unwrap(),
            b"from incoming"
        );
        assert_eq!(std::fs::read(store.workdir().join("new.txt")).unwrap(), b"fresh");
    }

    #[test]
    fn strict_merge_conflict_errors() {
        let (_dir, store) = store();
        write(&store, "shared.txt", b"base");
        store.commit("base").unwrap();

        store.switch_branch("incoming", None).unwrap();
        write(&store, "shared.txt", b"theirs");
        store.commit("incoming").unwrap();

        store.switch_branch("master", None).unwrap();
        write(&store, "shared.txt", b"ours");
        store.commit("master").unwrap();

        let err = store
            .merge("incoming", &MergeOptions::default())
            .expect_err("conflict");
        assert!(err.to_string().contains("conflict"));
    }

    #[test]
    fn staged_merge_lands_in_next_commit() {
        let (_dir, store) = store();
        write(&store, "a.txt", b"one");
        store.commit("base").unwrap();

        store.switch_branch("incoming", None).unwrap();
        write(&store, "b.txt", b"two");
        store.commit("incoming adds b").unwrap();
        let incoming_tip = store.branch_tip("incoming").unwrap().unwrap();

        store.switch_branch("master", None).unwrap();
        let outcome = store
            .merge("incoming", &MergeOptions::default().theirs().no_commit())
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Staged);

        // Extraction-style edit on top of the staged merge.
        write(&store, "c.txt", b"three");
        let id = store.commit("merge plus extraction").unwrap().unwrap();

        assert!(store.is_ancestor(&incoming_tip, &id).unwrap());
        let paths = store.paths_at(&id).unwrap();
        assert_eq!(paths, vec!["a.txt", "b.txt", "c.txt"]);
    }

    #[test]
    fn merge_of_contained_source_is_noop() {
        let (_dir, store) = store();
        write(&store, "a.txt", b"one");
        store.commit("base").unwrap();

        store.switch_branch("incoming", None).unwrap();
        store.switch_branch("master", None).unwrap();
        let outcome = store.merge("incoming", &MergeOptions::default()).unwrap();
        assert_eq!(outcome, MergeOutcome::Noop);
    }

    #[test]
    fn deletion_in_source_propagates() {
        let (_dir, store) = store();
        write(&store, "a.txt", b"one");
        write(&store, "b.txt", b"two");
        store.commit("base").unwrap();

        store.switch_branch("incoming", None).unwrap();
        std::fs::remove_file(store.workdir().join("b.txt")).unwrap();
        store.commit("drop b").unwrap();

        store.switch_branch("master", None).unwrap();
        store
            .merge("incoming", &MergeOptions::default().theirs())
            .unwrap();
        assert!(!store.workdir().join("b.txt").exists());
    }

    #[test]
    fn tags_resolve_and_never_overwrite() {
        let (_dir, store) = store();
        write(&store, "a.txt", b"one");
        let tip = store.commit("add a").unwrap().unwrap();

        store.tag("1.0.0", "release 1.0.0").unwrap();
        assert_eq!(store.tag_target("1.0.0").unwrap(), Some(tip));
        assert!(store.tag("1.0.0", "again").is_err());
    }

    #[test]
    fn diff_reports_path_changes() {
        let (_dir, store) = store();
        write(&store, "keep.txt", b"same");
        write(&store, "change.txt", b"old");
        write(&store, "drop.txt", b"bye");
        let from = store.commit("from").unwrap().unwrap();

        write(&store, "change.txt", b"new");
        write(&store, "add.txt", b"hi");
        std::fs::remove_file(store.workdir().join("drop.txt")).unwrap();
        let to = store.commit("to").unwrap().unwrap();

        let changes = store.diff(&from, &to).unwrap();
        assert_eq!(
            changes,
            vec![
                PathChange {
                    path: "add.txt".into(),
                    kind: ChangeKind::Added
                },
                PathChange {
                    path: "change.txt".into(),
                    kind: ChangeKind::Modified
                },
                PathChange {
                    path: "drop.txt".into(),
                    kind: ChangeKind::Removed
                },
            ]
        );
    }

    #[test]
    fn ignored_paths_survive_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path().join("repo"))
            .unwrap()
            .ignore(".alluvium/run.lock");
        write(&store, "a.txt", b"one");
        store.commit("add a").unwrap();
        write(&store, ".alluvium/run.lock", b"pid");

        store.switch_branch("incoming", None).unwrap();
        assert!(store.workdir().join(".alluvium/run.lock").exists());
        // And the lock never enters version tracking.
        let tip = store.branch_tip("incoming").unwrap().unwrap();
        assert_eq!(store.paths_at(&tip).unwrap(), vec!["a.txt"]);
    }
}
