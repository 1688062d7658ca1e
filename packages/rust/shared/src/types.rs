//! Core domain types shared across the alluvium crates.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for crawl run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Content fingerprint for change detection.
///
/// The status table compares fingerprints to decide whether a re-crawl needs
/// to download and commit anything. `Sha256` is preferred; `SizeMtime` is the
/// cheap fallback for sources that expose listings but not content hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Fingerprint {
    /// Hex-encoded SHA-256 of the payload bytes.
    Sha256 { hex: String },
    /// Size plus modification time, as reported by the source.
    SizeMtime { size: u64, mtime_epoch_s: i64 },
}

impl Fingerprint {
    /// Fingerprint a payload by hashing its bytes.
    pub fn sha256_of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::Sha256 {
            hex: format!("{:x}", hasher.finalize()),
        }
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sha256 { hex } => write!(f, "sha256:{hex}"),
            Self::SizeMtime {
                size,
                mtime_epoch_s,
            } => write!(f, "size-mtime:{size}:{mtime_epoch_s}"),
        }
    }
}
