//! Node resolving a record's `url` into a `response` payload.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use url::Url;

use alluvium_shared::AlluviumError;

use crate::fetch::Fetcher;
use crate::node::{Node, NodeOutput};
use crate::record::{Record, Value};

/// Downloads the resource named by the `url` key through the configured
/// [`Fetcher`], attaching `response` (bytes), `digest` (fingerprint) and,
/// when absent, `filename`.
///
/// A failed fetch of an individual resource is recoverable: it is logged,
/// counted in `errored`, and the record is dropped — unless `fail_on_error`
/// is set, in which case the whole run aborts.
pub struct FetchUrl {
    fetcher: Arc<dyn Fetcher>,
    fail_on_error: bool,
}

impl FetchUrl {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            fail_on_error: false,
        }
    }

    /// Abort the run on any fetch failure instead of skipping the resource.
    #[must_use]
    pub fn fail_on_error(mut self) -> Self {
        self.fail_on_error = true;
        self
    }
}

#[async_trait]
impl Node for FetchUrl {
    fn name(&self) -> &str {
        "fetch_url"
    }

    async fn process(&self, record: Record) -> NodeOutput {
        let url_str = record
            .text("url")
            .ok_or_else(|| AlluviumError::validation("fetch_url: record carries no `url`"))?;
        let url = Url::parse(url_str)
            .map_err(|e| AlluviumError::validation(format!("fetch_url: {url_str:?}: {e}")))?;

        debug!(%url, "fetching");
        match self.fetcher.fetch(&url).await {
            Ok(payload) => {
                record.stats().inc_fetched();
                record.stats().add_downloaded(payload.bytes.len() as u64);

                let mut out = record.with_many([
                    ("response", Value::Blob(payload.bytes)),
                    ("digest", Value::Text(payload.fingerprint.to_string())),
                ]);
                if !out.contains("filename") {
                    if let Some(hint) = payload.filename_hint {
                        out = out.with("filename", hint);
                    }
                }
                Ok(vec![out])
            }
            Err(err) if self.fail_on_error => Err(err.into()),
            Err(err) => {
                warn!(%url, error = %err, "fetch failed, skipping resource");
                record.stats().inc_errored();
                Ok(vec![])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::StaticFetcher;
    use crate::node::NodeSignal;

    fn fetcher() -> Arc<dyn Fetcher> {
        Arc::new(StaticFetcher::new().page("https://example.com/data/f1", b"one".to_vec()))
    }

    #[tokio::test]
    async fn attaches_response_and_digest() {
        let node = FetchUrl::new(fetcher());
        let rec = Record::root().with("url", "https://example.com/data/f1");

        let out = node.process(rec).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].blob("response").unwrap()[..], b"one");
        assert!(out[0].text("digest").unwrap().starts_with("sha256:"));
        assert_eq!(out[0].text("filename"), Some("f1"));
        assert_eq!(out[0].stats().snapshot().fetched, 1);
    }

    #[tokio::test]
    async fn existing_filename_is_kept() {
        let node = FetchUrl::new(fetcher());
        let rec = Record::root()
            .with("url", "https://example.com/data/f1")
            .with("filename", "renamed.dat");

        let out = node.process(rec).await.unwrap();
        assert_eq!(out[0].text("filename"), Some("renamed.dat"));
    }

    #[tokio::test]
    async fn failed_fetch_is_skipped_and_counted() {
        let node = FetchUrl::new(fetcher());
        let rec = Record::root().with("url", "https://example.com/data/missing");

        let out = node.process(rec.clone()).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(rec.stats().snapshot().errored, 1);
    }

    #[tokio::test]
    async fn fail_on_error_aborts() {
        let node = FetchUrl::new(fetcher()).fail_on_error();
        let rec = Record::root().with("url", "https://example.com/data/missing");

        assert!(matches!(
            node.process(rec).await,
            Err(NodeSignal::Abort(AlluviumError::Fetch(_)))
        ));
    }

    #[tokio::test]
    async fn record_without_url_aborts() {
        let node = FetchUrl::new(fetcher());
        assert!(matches!(
            node.process(Record::root()).await,
            Err(NodeSignal::Abort(_))
        ));
    }
}
