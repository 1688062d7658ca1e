//! Schema migrations for the status table.
//!
//! The on-disk file carries a `schema_version` field so the format can grow
//! without breaking idempotence guarantees: older files are upgraded in
//! memory on load and rewritten at the current version on the next save.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::info;

use alluvium_shared::{AlluviumError, Fingerprint, Result};

use crate::{StatusEntry, StatusFile};

/// Current schema version written by [`crate::StatusDb::save`].
pub const CURRENT_STATUS_SCHEMA: u32 = 1;

/// Upgrade a raw parsed status file to the current schema.
pub(crate) fn upgrade(raw: serde_json::Value, path: &Path) -> Result<StatusFile> {
    let version = raw
        .get("schema_version")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0) as u32;

    match version {
        0 => upgrade_v0(raw, path),
        CURRENT_STATUS_SCHEMA => serde_json::from_value(raw).map_err(|e| {
            AlluviumError::Status(format!(
                "corrupt status file {}: {e}; refusing to continue — \
                 use repair() to reset tracking explicitly",
                path.display()
            ))
        }),
        newer => Err(AlluviumError::Status(format!(
            "status file {} has schema_version {newer}, newer than supported {CURRENT_STATUS_SCHEMA}",
            path.display()
        ))),
    }
}

/// v0 was an ad hoc JSON object of `url -> hex sha256` with no envelope.
/// Filenames were not tracked, so upgraded entries start with none and are
/// filled in on the next successful ingest.
fn upgrade_v0(raw: serde_json::Value, path: &Path) -> Result<StatusFile> {
    let object = raw.as_object().ok_or_else(|| {
        AlluviumError::Status(format!(
            "corrupt status file {}: expected an object; \
             use repair() to reset tracking explicitly",
            path.display()
        ))
    })?;

    let mut entries = BTreeMap::new();
    for (url, value) in object {
        let hex = value.as_str().ok_or_else(|| {
            AlluviumError::Status(format!(
                "corrupt status file {}: legacy entry for {url:?} is not a hash string",
                path.display()
            ))
        })?;
        entries.insert(
            url.clone(),
            StatusEntry {
                fingerprint: Fingerprint::Sha256 {
                    hex: hex.to_string(),
                },
                filenames: Vec::new(),
                last_modified: DateTime::<Utc>::UNIX_EPOCH,
                stale: false,
            },
        );
    }

    info!(
        path = %path.display(),
        entries = entries.len(),
        "upgraded legacy status file to schema v1"
    );
    Ok(StatusFile {
        schema_version: CURRENT_STATUS_SCHEMA,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v0_blob_upgrades() {
        let raw: serde_json::Value = serde_json::from_str(
            r#"{"https://x/a": "aabb", "https://x/b": "ccdd"}"#,
        )
        .unwrap();

        let file = upgrade(raw, Path::new("status.json")).unwrap();
        assert_eq!(file.schema_version, CURRENT_STATUS_SCHEMA);
        assert_eq!(file.entries.len(), 2);
        assert_eq!(
            file.entries["https://x/a"].fingerprint,
            Fingerprint::Sha256 { hex: "aabb".into() }
        );
        assert!(file.entries["https://x/a"].filenames.is_empty());
    }

    #[test]
    fn newer_schema_is_rejected() {
        let raw = serde_json::json!({ "schema_version": 99, "entries": {} });
        let err = upgrade(raw, Path::new("status.json")).expect_err("newer");
        assert!(err.to_string().contains("schema_version 99"));
    }

    #[test]
    fn current_schema_parses() {
        let raw = serde_json::json!({
            "schema_version": 1,
            "entries": {
                "https://x/a": {
                    "fingerprint": { "kind": "sha256", "hex": "aabb" },
                    "filenames": ["a.dat"],
                    "last_modified": "2026-01-01T00:00:00Z",
                    "stale": false
                }
            }
        });
        let file = upgrade(raw, Path::new("status.json")).unwrap();
        assert_eq!(file.entries["https://x/a"].filenames, vec!["a.dat"]);
    }
}
