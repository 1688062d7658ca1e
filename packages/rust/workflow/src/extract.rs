//! Archive extraction and canonical/individual reconciliation.
//!
//! Extraction is a deterministic function of the merged incoming tree plus
//! the ruleset in [`ExtractConfig`]: running it twice over the same tree
//! yields the same result, which is what lets re-crawls commit nothing.
//!
//! Reconciliation treats the bulk archive as authoritative over files that
//! were also fetched individually:
//!
//! | situation                                  | resolution                     |
//! |--------------------------------------------|--------------------------------|
//! | file only in archive                       | keep, extract                  |
//! | file only individually fetched             | drop, warn                     |
//! | in both, identical content                 | keep canonical copy            |
//! | in both, differing content                 | keep canonical copy, warn      |
//! | no archive, extraction required            | fail run                       |
//! | no archive, extraction optional            | skip, pass through unchanged   |

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use alluvium_shared::{AlluviumError, Result};
use alluvium_pipeline::nodes::walk_files;

/// Default pattern for archive-like filenames.
pub const DEFAULT_ARCHIVE_REGEX: &str = r"\.(zip|tgz|tar(\..+)?)$";

// ---------------------------------------------------------------------------
// Config & outcome
// ---------------------------------------------------------------------------

/// Extraction ruleset, fixed per pipeline configuration.
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    /// Regex selecting archive files in the working tree.
    pub archive_regex: String,
    /// Fail the run when no archive matches.
    pub required: bool,
    /// Strip leading path components shared by all entries of an archive.
    pub strip_leading_dirs: bool,
    /// How many shared leading components to strip at most.
    pub leading_dirs_depth: u32,
    /// Entries matching this regex are never extracted (junk filter).
    pub exclude: Option<String>,
    /// Remove the archive file itself after extraction.
    pub delete_archive: bool,
    /// Prefix extracted entries with the archive's stem.
    pub add_archive_leading_dir: bool,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            archive_regex: DEFAULT_ARCHIVE_REGEX.to_string(),
            required: false,
            strip_leading_dirs: true,
            leading_dirs_depth: 1,
            exclude: Some(r".*__MACOSX.*".to_string()),
            delete_archive: true,
            add_archive_leading_dir: false,
        }
    }
}

/// What extraction and reconciliation did to the working tree.
#[derive(Debug, Default)]
pub struct ExtractOutcome {
    /// Archive files found, in sorted order.
    pub archives: Vec<String>,
    /// Paths extracted from the canonical archives.
    pub extracted: Vec<String>,
    /// Individually fetched files absent from the archives, removed.
    pub dropped: Vec<String>,
    /// Individually fetched files whose content disagreed with the archive;
    /// the canonical copy won.
    pub clashes: Vec<String>,
    /// Dataset version strings parsed from archive filenames.
    pub versions: Vec<String>,
    /// True when no archive was found and extraction was optional.
    pub skipped: bool,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Locate archives under `workdir`, extract them, and reconcile against the
/// individually fetched files listed in `individual` (workdir-relative).
pub fn reconcile_and_extract(
    workdir: &Path,
    cfg: &ExtractConfig,
    individual: &[String],
) -> Result<ExtractOutcome> {
    let archive_re = Regex::new(&cfg.archive_regex).map_err(|e| {
        AlluviumError::config(format!("archive pattern {:?}: {e}", cfg.archive_regex))
    })?;
    let exclude_re = cfg
        .exclude
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|e| AlluviumError::config(format!("exclude pattern: {e}")))?;

    let mut outcome = ExtractOutcome::default();
    outcome.archives = walk_files(workdir)?
        .into_iter()
        .filter(|rel| archive_re.is_match(rel))
        .collect();

    if outcome.archives.is_empty() {
        if cfg.required {
            return Err(AlluviumError::Extract(format!(
                "no archive matching {:?} under {}",
                cfg.archive_regex,
                workdir.display()
            )));
        }
        debug!("no archive found, extraction skipped");
        outcome.skipped = true;
        return Ok(outcome);
    }

    // Canonical content: union of all archives, first (sorted) archive wins
    // on overlap.
    let mut canonical: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for archive in &outcome.archives {
        let path = workdir.join(archive);
        let mut entries = unpack_entries(&path)?;

        if let Some(re) = &exclude_re {
            entries.retain(|(name, _)| !re.is_match(name));
        }
        if cfg.strip_leading_dirs {
            strip_leading_dirs(&mut entries, cfg.leading_dirs_depth);
        }
        if cfg.add_archive_leading_dir {
            let stem = archive_stem(archive);
            for (name, _) in &mut entries {
                *name = format!("{stem}/{name}");
            }
        }

        if let Some(version) = parse_version(archive) {
            outcome.versions.push(version);
        }

        for (name, bytes) in entries {
            canonical.entry(name).or_insert(bytes);
        }
    }

    // Reconcile individually fetched files against the canonical content.
    for rel in individual {
        if archive_re.is_match(rel) {
            continue;
        }
        let on_disk = workdir.join(rel);
        match canonical.get(rel) {
            None => {
                if on_disk.exists() {
                    warn!(
                        file = %rel,
                        "individually fetched file absent from canonical archive, dropping"
                    );
                    std::fs::remove_file(&on_disk).map_err(|e| AlluviumError::io(&on_disk, e))?;
                    outcome.dropped.push(rel.clone());
                }
            }
            Some(canonical_bytes) => {
                if !on_disk.exists() {
                    continue;
                }
                let existing =
                    std::fs::read(&on_disk).map_err(|e| AlluviumError::io(&on_disk, e))?;
                if &existing != canonical_bytes {
                    warn!(
                        file = %rel,
                        "individually fetched copy differs from canonical archive, \
                         keeping the archive's version"
                    );
                    outcome.clashes.push(rel.clone());
                }
            }
        }
    }

    // Materialize the canonical tree.
    for (rel, bytes) in &canonical {
        let path = workdir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AlluviumError::io(parent, e))?;
        }
        std::fs::write(&path, bytes).map_err(|e| AlluviumError::io(&path, e))?;
        outcome.extracted.push(rel.clone());
    }

    if cfg.delete_archive {
        for archive in &outcome.archives {
            let path = workdir.join(archive);
            std::fs::remove_file(&path).map_err(|e| AlluviumError::io(&path, e))?;
        }
    }

    info!(
        archives = outcome.archives.len(),
        extracted = outcome.extracted.len(),
        dropped = outcome.dropped.len(),
        clashes = outcome.clashes.len(),
        "extraction reconciled"
    );
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Unpacking
// ---------------------------------------------------------------------------

/// Read every regular-file entry of an archive into memory. Any read or
/// format error is fatal for the run.
fn unpack_entries(path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let file = File::open(path).map_err(|e| AlluviumError::io(path, e))?;
    let entries = if name.ends_with(".zip") {
        unpack_zip(file, path)?
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        unpack_tar(flate2::read::GzDecoder::new(file), path)?
    } else if name.ends_with(".tar") {
        unpack_tar(file, path)?
    } else {
        return Err(AlluviumError::Extract(format!(
            "unsupported archive type: {}",
            path.display()
        )));
    };

    // Zip-slip style names never leave the extraction root.
    Ok(entries
        .into_iter()
        .filter(|(name, _)| {
            let safe = !name.starts_with('/') && !name.split('/').any(|c| c == "..");
            if !safe {
                warn!(entry = %name, archive = %path.display(), "unsafe entry path skipped");
            }
            safe
        })
        .collect())
}

fn unpack_tar(reader: impl Read, path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive = tar::Archive::new(reader);
    let mut out = Vec::new();

    let entries = archive
        .entries()
        .map_err(|e| AlluviumError::Extract(format!("{}: {e}", path.display())))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| AlluviumError::Extract(format!("{}: {e}", path.display())))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .map_err(|e| AlluviumError::Extract(format!("{}: {e}", path.display())))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| AlluviumError::Extract(format!("{}: {e}", path.display())))?;
        out.push((name, bytes));
    }
    Ok(out)
}

fn unpack_zip(file: File, path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| AlluviumError::Extract(format!("{}: {e}", path.display())))?;
    let mut out = Vec::new();

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| AlluviumError::Extract(format!("{}: {e}", path.display())))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().replace('\\', "/");
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| AlluviumError::Extract(format!("{}: {e}", path.display())))?;
        out.push((name, bytes));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Strip up to `depth` leading path components, as long as every entry
/// shares the same one.
fn strip_leading_dirs(entries: &mut [(String, Vec<u8>)], depth: u32) {
    for _ in 0..depth {
        let Some(first) = entries.first() else { return };
        let Some(lead) = first.0.split('/').next().map(str::to_string) else {
            return;
        };

        let all_share = entries.iter().all(|(name, _)| {
            let mut parts = name.splitn(2, '/');
            parts.next() == Some(lead.as_str()) && parts.next().is_some()
        });
        if !all_share {
            return;
        }

        for (name, _) in entries.iter_mut() {
            *name = name.splitn(2, '/').nth(1).expect("checked above").to_string();
        }
    }
}

/// Archive filename without its archive extension.
fn archive_stem(name: &str) -> String {
    let base = name.rsplit('/').next().unwrap_or(name);
    for suffix in [".tar.gz", ".tar.bz2", ".tar.xz", ".tgz", ".tar", ".zip"] {
        if let Some(stem) = base.strip_suffix(suffix) {
            return stem.to_string();
        }
    }
    base.to_string()
}

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-_]v?(\d+(?:\.\d+)*)$").expect("valid regex"));

/// Dataset version suffix of an archive filename, e.g.
/// `data_v1.0.tar.gz` → `1.0`.
pub fn parse_version(archive: &str) -> Option<String> {
    VERSION_RE
        .captures(&archive_stem(archive))
        .map(|caps| caps[1].to_string())
}
