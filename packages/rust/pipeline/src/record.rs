//! The unit of data flowing through a pipeline.
//!
//! A [`Record`] is an ordered map from string keys to [`Value`]s, immutable
//! by convention: nodes never mutate the record they received, they derive
//! new records via [`Record::with`] and friends. The executor reinforces
//! this by handing every node an owned clone.
//!
//! Conventional keys used by the core: `url` (next resource to fetch),
//! `filename`/`path` (target location in the store), `response` (fetched
//! payload), `version` (dataset version discovered during extraction).

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::stats::Stats;

/// A value stored under a record key.
///
/// `Blob` payloads are reference-counted so fan-out cloning never copies
/// response bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Map(BTreeMap<String, Value>),
    Blob(Arc<[u8]>),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Arc<[u8]>> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Blob(Arc::from(bytes))
    }
}

impl From<Arc<[u8]>> for Value {
    fn from(bytes: Arc<[u8]>) -> Self {
        Self::Blob(bytes)
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// The unit of data passed between pipeline stages.
///
/// Cloning a record is cheap: data keys are copied (blobs by refcount) and
/// the statistics handle is shared, so counters incremented in one fan-out
/// branch are visible to all others and to the executor.
#[derive(Debug, Clone)]
pub struct Record {
    data: BTreeMap<String, Value>,
    stats: Stats,
}

impl Record {
    /// Create the single root record for a crawl run, with fresh statistics.
    pub fn root() -> Self {
        Self {
            data: BTreeMap::new(),
            stats: Stats::new(),
        }
    }

    /// Create an empty record sharing an existing statistics handle.
    pub fn with_stats(stats: Stats) -> Self {
        Self {
            data: BTreeMap::new(),
            stats,
        }
    }

    /// The shared statistics accumulator riding on this record.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Text value under `key`, if present and textual.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_text)
    }

    /// Blob value under `key`, if present and binary.
    pub fn blob(&self, key: &str) -> Option<&Arc<[u8]>> {
        self.data.get(key).and_then(Value::as_blob)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Derive a new record with `key` set to `value`.
    #[must_use]
    pub fn with(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut data = self.data.clone();
        data.insert(key.into(), value.into());
        Self {
            data,
            stats: self.stats.clone(),
        }
    }

    /// Derive a new record with several keys set at once.
    #[must_use]
    pub fn with_many<K, V, I>(&self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut data = self.data.clone();
        for (k, v) in pairs {
            data.insert(k.into(), v.into());
        }
        Self {
            data,
            stats: self.stats.clone(),
        }
    }

    /// Derive a new record with `key` removed.
    #[must_use]
    pub fn without(&self, key: &str) -> Self {
        let mut data = self.data.clone();
        data.remove(key);
        Self {
            data,
            stats: self.stats.clone(),
        }
    }

    /// Derive a new record with `from` renamed to `to` (no-op if absent).
    #[must_use]
    pub fn renamed(&self, from: &str, to: impl Into<String>) -> Self {
        let mut data = self.data.clone();
        if let Some(v) = data.remove(from) {
            data.insert(to.into(), v);
        }
        Self {
            data,
            stats: self.stats.clone(),
        }
    }
}
