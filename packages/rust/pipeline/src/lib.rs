//! Pipeline execution engine for alluvium.
//!
//! This crate provides:
//! - [`Record`] / [`Value`] — the unit of data flowing through a pipeline
//! - [`Node`] — the stage contract, with [`NodeSignal`] control signals
//! - [`Tree`] — composition into sequences and fan-out branches
//! - [`Executor`] — drives the tree, aggregates [`Stats`], handles signals
//! - [`nodes`] — generic transform nodes (assign, sub, skip_if, find_files, ...)
//! - [`fetch`] — the transport collaborator ([`Fetcher`], [`HttpFetcher`])

pub mod executor;
pub mod fetch;
pub mod node;
pub mod nodes;
pub mod record;
pub mod stats;
pub mod tree;

pub use executor::{CancelToken, Executor};
pub use fetch::{FetchedPayload, Fetcher, HttpFetcher, StaticFetcher, filename_from_url};
pub use node::{FnNode, Node, NodeOutput, NodeSignal, emitting};
pub use nodes::{Assign, FetchUrl, FindFiles, InterruptIf, Rename, SkipIf, Sub, range_node};
pub use record::{Record, Value};
pub use stats::{Stats, StatsSnapshot};
pub use tree::{Tree, leaf, par, scoped, seq, shared};
