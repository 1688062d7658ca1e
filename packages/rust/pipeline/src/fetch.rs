//! The transport/fetch collaborator.
//!
//! The core never talks HTTP directly; nodes that need bytes go through the
//! [`Fetcher`] trait so source-specific transports (and tests) can be
//! swapped in. [`HttpFetcher`] is the stock implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use alluvium_shared::{AlluviumError, Fingerprint, Result};

/// User-Agent string for fetch requests.
const USER_AGENT: &str = concat!("alluvium/", env!("CARGO_PKG_VERSION"));

/// A fetched payload plus its content fingerprint.
#[derive(Debug, Clone)]
pub struct FetchedPayload {
    /// Raw response bytes.
    pub bytes: Arc<[u8]>,
    /// Fingerprint for change detection.
    pub fingerprint: Fingerprint,
    /// Target filename suggested by the source (last URL path segment).
    pub filename_hint: Option<String>,
}

/// Transport collaborator: resolves a URL into bytes plus a fingerprint.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchedPayload>;
}

// ---------------------------------------------------------------------------
// HttpFetcher
// ---------------------------------------------------------------------------

/// HTTP(S) fetcher backed by `reqwest`.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AlluviumError::Fetch(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedPayload> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| AlluviumError::Fetch(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AlluviumError::Fetch(format!("{url}: HTTP {status}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AlluviumError::Fetch(format!("{url}: body read failed: {e}")))?;

        let bytes: Arc<[u8]> = Arc::from(bytes.to_vec());
        Ok(FetchedPayload {
            fingerprint: Fingerprint::sha256_of(&bytes),
            filename_hint: filename_from_url(url),
            bytes,
        })
    }
}

/// Last non-empty path segment of a URL, if any.
pub fn filename_from_url(url: &Url) -> Option<String> {
    url.path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// StaticFetcher
// ---------------------------------------------------------------------------

/// In-memory fetcher serving a fixed URL→bytes map. Used by unit tests and
/// offline pipeline dry-runs.
#[derive(Default)]
pub struct StaticFetcher {
    pages: HashMap<String, Arc<[u8]>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn page(mut self, url: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.pages.insert(url.into(), Arc::from(bytes.into()));
        self
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedPayload> {
        let bytes = self
            .pages
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| AlluviumError::Fetch(format!("{url}: not served")))?;

        Ok(FetchedPayload {
            fingerprint: Fingerprint::sha256_of(&bytes),
            filename_hint: filename_from_url(url),
            bytes,
        })
    }
}
