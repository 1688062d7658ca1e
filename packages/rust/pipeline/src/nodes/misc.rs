//! Generic, source-agnostic transform nodes.
//!
//! These are the building blocks pipeline templates compose around the
//! ingestion sink. Source-specific scrapers (HTML link extraction, API
//! pagination) live outside this crate and only need to satisfy the same
//! node contract.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use alluvium_shared::{AlluviumError, METADATA_DIR, Result};

use crate::node::{Node, NodeOutput, NodeSignal};
use crate::record::{Record, Value};

// ---------------------------------------------------------------------------
// assign
// ---------------------------------------------------------------------------

/// Set or overwrite record keys, optionally interpolating `%(key)s`
/// references against the incoming record's text values.
pub struct Assign {
    mapping: BTreeMap<String, String>,
    interpolate: bool,
}

impl Assign {
    pub fn new<K, V, I>(mapping: I, interpolate: bool) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            mapping: mapping
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            interpolate,
        }
    }
}

static INTERP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%\((\w+)\)s").expect("valid regex"));

fn interpolate(template: &str, record: &Record) -> String {
    INTERP_RE
        .replace_all(template, |caps: &regex::Captures<'_>| {
            record.text(&caps[1]).unwrap_or_default().to_string()
        })
        .into_owned()
}

#[async_trait]
impl Node for Assign {
    fn name(&self) -> &str {
        "assign"
    }

    async fn process(&self, record: Record) -> NodeOutput {
        let pairs = self.mapping.iter().map(|(k, v)| {
            let value = if self.interpolate {
                interpolate(v, &record)
            } else {
                v.clone()
            };
            (k.clone(), Value::Text(value))
        });
        // Collect before deriving so interpolation sees the original record.
        let pairs: Vec<_> = pairs.collect();
        Ok(vec![record.with_many(pairs)])
    }
}

// ---------------------------------------------------------------------------
// sub
// ---------------------------------------------------------------------------

/// Regex search/replace over named record fields.
pub struct Sub {
    subs: Vec<(String, Regex, String)>,
}

impl Sub {
    pub fn new() -> Self {
        Self { subs: Vec::new() }
    }

    /// Add a replacement applied to the text under `field`.
    pub fn field(
        mut self,
        field: impl Into<String>,
        pattern: &str,
        replacement: impl Into<String>,
    ) -> Result<Self> {
        let re = Regex::new(pattern)
            .map_err(|e| AlluviumError::config(format!("sub pattern {pattern:?}: {e}")))?;
        self.subs.push((field.into(), re, replacement.into()));
        Ok(self)
    }
}

impl Default for Sub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Node for Sub {
    fn name(&self) -> &str {
        "sub"
    }

    async fn process(&self, record: Record) -> NodeOutput {
        let mut out = record.clone();
        for (field, re, replacement) in &self.subs {
            if let Some(text) = out.text(field) {
                let replaced = re.replace_all(text, replacement.as_str()).into_owned();
                out = out.with(field.clone(), replaced);
            }
        }
        Ok(vec![out])
    }
}

// ---------------------------------------------------------------------------
// rename
// ---------------------------------------------------------------------------

/// Rename record keys.
pub struct Rename {
    mapping: BTreeMap<String, String>,
}

impl Rename {
    pub fn new<K, V, I>(mapping: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            mapping: mapping
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl Node for Rename {
    fn name(&self) -> &str {
        "rename"
    }

    async fn process(&self, record: Record) -> NodeOutput {
        let mut out = record;
        for (from, to) in &self.mapping {
            out = out.renamed(from, to.clone());
        }
        Ok(vec![out])
    }
}

// ---------------------------------------------------------------------------
// skip_if / interrupt_if
// ---------------------------------------------------------------------------

/// Field matchers shared by [`SkipIf`] and [`InterruptIf`].
fn all_match(matchers: &[(String, Regex)], record: &Record) -> bool {
    matchers.iter().all(|(field, re)| {
        record
            .text(field)
            .map(|text| re.is_match(text))
            .unwrap_or(false)
    })
}

fn compile_matchers<K, V, I>(matchers: I) -> Result<Vec<(String, Regex)>>
where
    K: Into<String>,
    V: AsRef<str>,
    I: IntoIterator<Item = (K, V)>,
{
    matchers
        .into_iter()
        .map(|(field, pattern)| {
            let re = Regex::new(pattern.as_ref()).map_err(|e| {
                AlluviumError::config(format!("matcher pattern {:?}: {e}", pattern.as_ref()))
            })?;
            Ok((field.into(), re))
        })
        .collect()
}

/// Finish the current branch when all field matchers match (or, negated,
/// when any does not).
pub struct SkipIf {
    matchers: Vec<(String, Regex)>,
    negate: bool,
}

impl SkipIf {
    pub fn new<K, V, I>(matchers: I, negate: bool) -> Result<Self>
    where
        K: Into<String>,
        V: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        Ok(Self {
            matchers: compile_matchers(matchers)?,
            negate,
        })
    }
}

#[async_trait]
impl Node for SkipIf {
    fn name(&self) -> &str {
        "skip_if"
    }

    async fn process(&self, record: Record) -> NodeOutput {
        let matched = all_match(&self.matchers, &record);
        if matched != self.negate {
            debug!("skip_if matched, finishing branch");
            return Err(NodeSignal::FinishBranch);
        }
        Ok(vec![record])
    }
}

/// Abort the whole run when all field matchers match. For conditions that
/// make continuing pointless (e.g. a "service unavailable" marker page).
pub struct InterruptIf {
    matchers: Vec<(String, Regex)>,
}

impl InterruptIf {
    pub fn new<K, V, I>(matchers: I) -> Result<Self>
    where
        K: Into<String>,
        V: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        Ok(Self {
            matchers: compile_matchers(matchers)?,
        })
    }
}

#[async_trait]
impl Node for InterruptIf {
    fn name(&self) -> &str {
        "interrupt_if"
    }

    async fn process(&self, record: Record) -> NodeOutput {
        if all_match(&self.matchers, &record) {
            let fields: Vec<_> = self.matchers.iter().map(|(f, _)| f.as_str()).collect();
            return Err(AlluviumError::validation(format!(
                "interrupt condition matched on {}",
                fields.join(", ")
            ))
            .into());
        }
        Ok(vec![record])
    }
}

// ---------------------------------------------------------------------------
// range
// ---------------------------------------------------------------------------

/// Emit one record per integer in `range`, under `key`. Pagination aid.
pub fn range_node(range: std::ops::Range<u64>, key: impl Into<String>) -> impl Node {
    let key = key.into();
    crate::node::emitting("range", move |record: Record| {
        range
            .clone()
            .map(|i| record.with(key.clone(), i.to_string()))
            .collect()
    })
}

// ---------------------------------------------------------------------------
// find_files
// ---------------------------------------------------------------------------

/// Walk a working tree and emit one record per file whose relative path
/// matches `pattern`. The crawl metadata directory is never descended into.
pub struct FindFiles {
    root: PathBuf,
    pattern: Regex,
    fail_if_none: bool,
}

impl FindFiles {
    pub fn new(root: impl Into<PathBuf>, pattern: &str, fail_if_none: bool) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| AlluviumError::config(format!("find_files pattern {pattern:?}: {e}")))?;
        Ok(Self {
            root: root.into(),
            pattern,
            fail_if_none,
        })
    }
}

/// Recursively collect relative file paths below `root`, sorted for
/// deterministic output.
pub fn walk_files(root: &Path) -> Result<Vec<String>> {
    fn visit(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        let entries = std::fs::read_dir(dir).map_err(|e| AlluviumError::io(dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| AlluviumError::io(dir, e))?;
            let path = entry.path();
            let file_name = entry.file_name();
            if path.is_dir() {
                if file_name == METADATA_DIR {
                    continue;
                }
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

#[async_trait]
impl Node for FindFiles {
    fn name(&self) -> &str {
        "find_files"
    }

    async fn process(&self, record: Record) -> NodeOutput {
        let files = walk_files(&self.root)?;
        let matched: Vec<_> = files
            .into_iter()
            .filter(|rel| self.pattern.is_match(rel))
            .collect();

        if matched.is_empty() && self.fail_if_none {
            return Err(AlluviumError::validation(format!(
                "no files matching {:?} under {}",
                self.pattern.as_str(),
                self.root.display()
            ))
            .into());
        }

        Ok(matched
            .into_iter()
            .map(|rel| record.with("filename", rel))
            .collect())
    }
}
