//! The node contract: a pipeline stage transforming one record into
//! zero-or-more records.

use async_trait::async_trait;

use alluvium_shared::{AlluviumError, Result};

use crate::record::Record;
use crate::stats::Stats;

/// Control signal a node may raise instead of producing output.
///
/// These are deliberately distinct from [`AlluviumError`]: the executor must
/// be able to tell "prune this branch" apart from "the run failed", and a
/// generic error type is never reused for both.
#[derive(Debug)]
pub enum NodeSignal {
    /// Finish the nearest enclosing branch early. Output produced so far is
    /// kept; sibling fan-out branches continue unaffected.
    FinishBranch,
    /// Stop the whole pipeline. Surfaced as a run failure at the root.
    Abort(AlluviumError),
}

impl From<AlluviumError> for NodeSignal {
    fn from(err: AlluviumError) -> Self {
        Self::Abort(err)
    }
}

/// What a node's `process` call yields: transformed records, or a signal.
pub type NodeOutput = std::result::Result<Vec<Record>, NodeSignal>;

/// A pipeline stage.
///
/// Nodes must not mutate the record they received; they derive new records
/// by copy-and-update. Stateful nodes keep interior state behind a lock and
/// may opt into [`Node::finalize`], invoked exactly once after all records
/// have flowed through the tree, to flush deferred side effects.
///
/// Node identity is the `Arc` pointer: placing one `Arc<dyn Node>` at
/// several tree positions intentionally aliases its state (e.g. one
/// ingestion sink shared by two fan-out branches). Distinct instances are
/// never implicitly shared.
#[async_trait]
pub trait Node: Send + Sync {
    /// Short name used in tracing output and tree debugging.
    fn name(&self) -> &str;

    /// Transform one record into zero-or-more records, or raise a signal.
    async fn process(&self, record: Record) -> NodeOutput;

    /// Flush deferred side effects. Called once per run, after the tree has
    /// finished, in reverse order of first use.
    async fn finalize(&self, stats: &Stats) -> Result<()> {
        let _ = stats;
        Ok(())
    }

    /// Whether the executor should invoke [`Node::finalize`] for this node.
    fn wants_finalize(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// FnNode
// ---------------------------------------------------------------------------

/// Adapter turning a plain function into a stateless transform node.
pub struct FnNode<F> {
    name: String,
    f: F,
}

impl<F> FnNode<F>
where
    F: Fn(Record) -> NodeOutput + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> Node for FnNode<F>
where
    F: Fn(Record) -> NodeOutput + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, record: Record) -> NodeOutput {
        (self.f)(record)
    }
}

/// Wrap a function that can only emit records (no signals).
pub fn emitting<F>(name: impl Into<String>, f: F) -> FnNode<impl Fn(Record) -> NodeOutput + Send + Sync>
where
    F: Fn(Record) -> Vec<Record> + Send + Sync,
{
    FnNode::new(name, move |record| Ok(f(record)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fn_node_transforms() {
        let node = emitting("double", |rec: Record| vec![rec.clone(), rec]);
        let out = node.process(Record::root()).await.expect("output");
        assert_eq!(out.len(), 2);
        assert_eq!(node.name(), "double");
    }

    #[tokio::test]
    async fn fn_node_can_signal() {
        let node = FnNode::new("stop", |_rec| Err(NodeSignal::FinishBranch));
        match node.process(Record::root()).await {
            Err(NodeSignal::FinishBranch) => {}
            other => panic!("expected FinishBranch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn abort_converts_from_error() {
        let node = FnNode::new("fail", |_rec| {
            Err(AlluviumError::validation("missing key").into())
        });
        match node.process(Record::root()).await {
            Err(NodeSignal::Abort(e)) => assert!(e.to_string().contains("missing key")),
            other => panic!("expected Abort, got {other:?}"),
        }
    }
}
