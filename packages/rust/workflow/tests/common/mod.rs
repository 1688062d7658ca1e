//! Shared helpers for workflow integration tests.

use std::path::Path;
use std::sync::Arc;

use alluvium_pipeline::{FetchUrl, Fetcher, Record, Tree, emitting, leaf, seq};
use alluvium_vcs::MemoryStore;
use alluvium_workflow::{Ingestor, RUN_LOCK_REL};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Fresh in-process store under `root`, with the run lock kept out of
/// version tracking.
pub fn new_store(root: &Path) -> Arc<MemoryStore> {
    Arc::new(
        MemoryStore::new(root.join("repo"))
            .expect("store")
            .ignore(RUN_LOCK_REL),
    )
}

/// Build a `.tar.gz` in memory from (name, bytes) pairs.
pub fn targz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(gz);
    for (name, bytes) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *bytes).expect("tar entry");
    }
    builder
        .into_inner()
        .expect("tar finish")
        .finish()
        .expect("gzip finish")
}

/// Incoming sub-pipeline: list the given URLs, fetch each, sink everything.
pub fn fetch_listing(
    ingestor: &Arc<Ingestor>,
    fetcher: Arc<dyn Fetcher>,
    urls: Vec<String>,
) -> Tree {
    let listing = emitting("listing", move |record: Record| {
        urls.iter().map(|u| record.with("url", u.as_str())).collect()
    });
    seq([leaf(listing), leaf(FetchUrl::new(fetcher)), ingestor.sink()])
}
