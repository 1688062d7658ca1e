//! Repository-local crawl configuration.
//!
//! Each crawled repository carries a `.alluvium/crawl.toml` describing which
//! pipeline template and parameters produced it, so a later `update` run can
//! rebuild the exact same pipeline. The file is an ordinary versioned file
//! and travels with the repository's commits, alongside the status tables in
//! `.alluvium/status/`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AlluviumError, Result};

/// Directory holding crawl metadata inside the repository working tree.
pub const METADATA_DIR: &str = ".alluvium";

/// Crawl configuration file name under [`METADATA_DIR`].
pub const CRAWL_CONFIG_FILENAME: &str = "crawl.toml";

/// Directory for per-stream status tables under [`METADATA_DIR`].
pub const STATUS_DIR: &str = "status";

/// Scratch directory for extraction, cleaned up on finalize.
pub const TMP_DIR: &str = "tmp";

// ---------------------------------------------------------------------------
// Config structs (matching crawl.toml schema)
// ---------------------------------------------------------------------------

/// Top-level crawl spec, deserialized from `.alluvium/crawl.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlSpec {
    /// Which pipeline template produced this repository, and with what.
    #[serde(default)]
    pub pipeline: PipelineSpec,

    /// Run policies.
    #[serde(default)]
    pub policies: PoliciesSpec,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Template name (e.g. "ingest-with-archives").
    #[serde(default = "default_template")]
    pub template: String,

    /// Logical incoming-stream name; selects the status table file.
    #[serde(default = "default_stream")]
    pub stream: String,

    /// Free-form template parameters (url, archive_regex, ...).
    #[serde(default)]
    pub params: BTreeMap<String, toml::Value>,
}

impl Default for PipelineSpec {
    fn default() -> Self {
        Self {
            template: default_template(),
            stream: default_stream(),
            params: BTreeMap::new(),
        }
    }
}

fn default_template() -> String {
    "ingest-with-archives".into()
}
fn default_stream() -> String {
    "default".into()
}

/// `[policies]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoliciesSpec {
    /// What to do with tracked files whose URL disappeared upstream:
    /// "mark-stale" or "delete".
    #[serde(default = "default_removal")]
    pub removal: String,

    /// Abort the run if any individually listed resource fails to fetch.
    #[serde(default)]
    pub fail_on_missing: bool,
}

impl Default for PoliciesSpec {
    fn default() -> Self {
        Self {
            removal: default_removal(),
            fail_on_missing: false,
        }
    }
}

fn default_removal() -> String {
    "mark-stale".into()
}

// ---------------------------------------------------------------------------
// Loading & saving
// ---------------------------------------------------------------------------

/// Path to the crawl spec inside a repository working tree.
pub fn crawl_spec_path(repo_root: &Path) -> PathBuf {
    repo_root.join(METADATA_DIR).join(CRAWL_CONFIG_FILENAME)
}

/// Load the crawl spec from a repository. Errors if the file is absent,
/// since a repository without one was not produced by a crawl.
pub fn load_crawl_spec(repo_root: &Path) -> Result<CrawlSpec> {
    let path = crawl_spec_path(repo_root);
    let content = std::fs::read_to_string(&path).map_err(|e| AlluviumError::io(&path, e))?;

    toml::from_str(&content).map_err(|e| {
        AlluviumError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Write the crawl spec into a repository working tree, creating
/// `.alluvium/` if needed. Returns the path written.
pub fn save_crawl_spec(repo_root: &Path, spec: &CrawlSpec) -> Result<PathBuf> {
    let path = crawl_spec_path(repo_root);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| AlluviumError::io(parent, e))?;
    }

    let content =
        toml::to_string_pretty(spec).map_err(|e| AlluviumError::config(e.to_string()))?;
    std::fs::write(&path, content).map_err(|e| AlluviumError::io(&path, e))?;
    tracing::debug!(?path, "wrote crawl spec");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_spec_serializes() {
        let spec = CrawlSpec::default();
        let toml_str = toml::to_string_pretty(&spec).expect("serialize default spec");
        assert!(toml_str.contains("ingest-with-archives"));
        assert!(toml_str.contains("mark-stale"));
    }

    #[test]
    fn spec_roundtrip() {
        let toml_str = r#"
[pipeline]
template = "ingest-with-archives"
stream = "releases"

[pipeline.params]
url = "https://example.com/data/"
archive_regex = '\.(zip|tgz|tar(\..+)?)$'

[policies]
removal = "delete"
fail_on_missing = true
"#;
        let spec: CrawlSpec = toml::from_str(toml_str).expect("parse");
        assert_eq!(spec.pipeline.stream, "releases");
        assert_eq!(spec.policies.removal, "delete");
        assert!(spec.policies.fail_on_missing);
        assert_eq!(
            spec.pipeline.params.get("url").and_then(|v| v.as_str()),
            Some("https://example.com/data/")
        );
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut spec = CrawlSpec::default();
        spec.pipeline.stream = "main".into();

        save_crawl_spec(dir.path(), &spec).expect("save");
        let loaded = load_crawl_spec(dir.path()).expect("load");
        assert_eq!(loaded.pipeline.stream, "main");
    }

    #[test]
    fn missing_spec_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(load_crawl_spec(dir.path()).is_err());
    }
}
