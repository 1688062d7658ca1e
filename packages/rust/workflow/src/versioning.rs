//! Dataset version tagging.
//!
//! When extraction distinguishes dataset versions (suffixed release
//! filenames), the resulting `master` commit is tagged with the version
//! string. Re-extraction with no net change reuses the existing tag; a
//! disambiguating suffix is appended only when content under the same
//! version actually differs.

use tracing::{debug, info};

use alluvium_shared::{AlluviumError, Result};
use alluvium_vcs::VersionedStore;

/// Tag the current branch tip with `version`, reusing or disambiguating
/// existing tags. Returns the tag name actually used.
pub fn apply_version_tag(store: &dyn VersionedStore, version: &str) -> Result<String> {
    let branch = store.current_branch()?;
    let tip = store
        .branch_tip(&branch)?
        .ok_or_else(|| AlluviumError::Store(format!("branch {branch:?} has no tip")))?;

    let mut name = version.to_string();
    let mut suffix = 0u32;
    loop {
        match store.tag_target(&name)? {
            None => {
                store.tag(&name, &format!("dataset version {version}"))?;
                info!(tag = %name, "version tagged");
                return Ok(name);
            }
            Some(target) if target == tip || store.diff(&target, &tip)?.is_empty() => {
                debug!(tag = %name, "existing version tag matches content, reused");
                return Ok(name);
            }
            Some(_) => {
                suffix += 1;
                name = format!("{version}+{suffix}");
            }
        }
    }
}
