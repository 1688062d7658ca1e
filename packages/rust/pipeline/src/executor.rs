//! Drives a pipeline tree to completion.
//!
//! The executor is pure orchestration: it feeds records through the tree
//! stage by stage on a single logical thread, routes the two control
//! signals, invokes finalize hooks, and reports statistics. All side
//! effects belong to the nodes themselves.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, instrument};

use alluvium_shared::{AlluviumError, Result};

use crate::node::{Node, NodeSignal};
use crate::record::Record;
use crate::stats::{Stats, StatsSnapshot};
use crate::tree::Tree;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation handle, checked between records.
///
/// Cancelling never interrupts a node mid-record, so an interrupted run
/// leaves the versioned store either in its pre-run state or at a cleanly
/// committed intermediate state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Executes a [`Tree`] against one initial record.
#[derive(Default)]
pub struct Executor {
    cancel: CancelToken,
}

/// Output of one subtree execution.
struct Flow {
    records: Vec<Record>,
    /// A `FinishBranch` reached the top of this subtree and has not yet been
    /// absorbed by an enclosing boundary.
    finished: bool,
}

/// Tracks finalize-nodes in order of first use, deduplicated by instance.
#[derive(Default)]
struct FinalizeTracker(Mutex<Vec<Arc<dyn Node>>>);

impl FinalizeTracker {
    fn track(&self, node: &Arc<dyn Node>) {
        if !node.wants_finalize() {
            return;
        }
        let mut seen = self.0.lock().expect("finalize tracker poisoned");
        if !seen.iter().any(|n| Arc::ptr_eq(n, node)) {
            seen.push(node.clone());
        }
    }

    fn drain_reversed(&self) -> Vec<Arc<dyn Node>> {
        let mut seen = self.0.lock().expect("finalize tracker poisoned");
        let mut nodes: Vec<_> = seen.drain(..).collect();
        nodes.reverse();
        nodes
    }
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self { cancel }
    }

    /// The token that cancels runs driven by this executor.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the tree to completion on a single initial record.
    ///
    /// Returns the records emitted by the tree's final stage and a snapshot
    /// of the shared statistics. A `FinishBranch` that reaches the root
    /// simply ends the run with the output produced so far; an `Abort`
    /// surfaces as the error it carries, and no finalize hooks are invoked.
    #[instrument(skip_all, fields(leaves = tree.len()))]
    pub async fn run(&self, tree: &Tree, initial: Record) -> Result<(Vec<Record>, StatsSnapshot)> {
        let stats = initial.stats().clone();
        let tracker = FinalizeTracker::default();

        let flow = self.exec(tree, vec![initial], &tracker).await?;

        // Deferred side effects flush in reverse order of first use, so
        // downstream sinks flush before the upstream state they depend on.
        for node in tracker.drain_reversed() {
            debug!(node = node.name(), "finalizing");
            node.finalize(&stats).await?;
        }

        let snapshot = stats.snapshot();
        info!(records = flow.records.len(), %snapshot, "pipeline run complete");
        Ok((flow.records, snapshot))
    }

    fn exec<'a>(
        &'a self,
        tree: &'a Tree,
        inputs: Vec<Record>,
        tracker: &'a FinalizeTracker,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<Flow>> + Send + 'a>> {
        Box::pin(async move {
            match tree {
                Tree::Leaf(node) => self.exec_leaf(node, inputs, tracker).await,

                Tree::Sequence(children) => {
                    let mut records = inputs;
                    for child in children {
                        let flow = self.exec(child, records, tracker).await?;
                        records = flow.records;
                        if flow.finished {
                            // Branch finished early: remaining stages are
                            // skipped, partial output is this sequence's
                            // output, and the signal stops here.
                            return Ok(Flow {
                                records,
                                finished: false,
                            });
                        }
                    }
                    Ok(Flow {
                        records,
                        finished: false,
                    })
                }

                Tree::Parallel(children) => {
                    // Every record is routed through every subtree; output is
                    // the concatenation of each subtree's output in declared
                    // order. A finished subtree keeps its partial output and
                    // leaves siblings untouched.
                    let mut out = Vec::new();
                    for child in children {
                        let flow = self.exec(child, inputs.clone(), tracker).await?;
                        out.extend(flow.records);
                    }
                    Ok(Flow {
                        records: out,
                        finished: false,
                    })
                }

                Tree::Scoped(child) => {
                    // Side-effecting sub-pipeline: runs on the same records
                    // but its output is discarded and the inputs flow on.
                    let _ = self.exec(child, inputs.clone(), tracker).await?;
                    Ok(Flow {
                        records: inputs,
                        finished: false,
                    })
                }
            }
        })
    }

    async fn exec_leaf(
        &self,
        node: &Arc<dyn Node>,
        inputs: Vec<Record>,
        tracker: &FinalizeTracker,
    ) -> Result<Flow> {
        let mut out = Vec::new();
        for record in inputs {
            if self.cancel.is_cancelled() {
                return Err(AlluviumError::Cancelled);
            }
            tracker.track(node);

            let stats = record.stats().clone();
            match node.process(record).await {
                Ok(mut produced) => out.append(&mut produced),
                Err(NodeSignal::FinishBranch) => {
                    debug!(node = node.name(), "branch finished early");
                    stats.inc_branches_finished();
                    return Ok(Flow {
                        records: out,
                        finished: true,
                    });
                }
                Err(NodeSignal::Abort(err)) => {
                    return Err(err);
                }
            }
        }
        Ok(Flow {
            records: out,
            finished: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::node::{FnNode, NodeOutput, emitting};
    use crate::tree::{leaf, par, scoped, seq, shared};

    fn tag(name: &'static str) -> impl Node {
        emitting(name, move |r: Record| vec![r.with("tag", name)])
    }

    /// Emits its input until `limit` records have passed, then finishes the
    /// branch.
    struct TakeThenFinish {
        limit: usize,
        seen: Mutex<usize>,
    }

    impl TakeThenFinish {
        fn new(limit: usize) -> Self {
            Self {
                limit,
                seen: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl Node for TakeThenFinish {
        fn name(&self) -> &str {
            "take_then_finish"
        }

        async fn process(&self, record: Record) -> NodeOutput {
            let mut seen = self.seen.lock().unwrap();
            if *seen >= self.limit {
                return Err(NodeSignal::FinishBranch);
            }
            *seen += 1;
            Ok(vec![record])
        }
    }

    /// Records first use and finalization order into a shared log.
    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Node for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn process(&self, record: Record) -> NodeOutput {
            Ok(vec![record])
        }

        async fn finalize(&self, _stats: &Stats) -> Result<()> {
            self.log.lock().unwrap().push(self.name.clone());
            Ok(())
        }

        fn wants_finalize(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn sequence_preserves_stage_order() {
        let emit_two = emitting("emit_two", |r: Record| {
            vec![r.with("n", "1"), r.with("n", "2")]
        });
        let tree = seq([leaf(emit_two), leaf(tag("after"))]);

        let (records, _stats) = Executor::new().run(&tree, Record::root()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].text("n"), Some("1"));
        assert_eq!(records[1].text("n"), Some("2"));
        assert!(records.iter().all(|r| r.text("tag") == Some("after")));
    }

    #[tokio::test]
    async fn fan_out_concatenates_in_declared_order() {
        let tree = par([leaf(tag("one")), leaf(tag("two")), leaf(tag("three"))]);

        let (records, _stats) = Executor::new().run(&tree, Record::root()).await.unwrap();
        let tags: Vec<_> = records.iter().map(|r| r.text("tag").unwrap()).collect();
        assert_eq!(tags, ["one", "two", "three"]);
    }

    #[tokio::test]
    async fn finish_branch_does_not_affect_siblings() {
        // 3-way fan-out fed with two records; branch 2 finishes after one.
        let emit_two = emitting("emit_two", |r: Record| {
            vec![r.with("n", "1"), r.with("n", "2")]
        });
        let tree = seq([
            leaf(emit_two),
            par([
                leaf(tag("one")),
                seq([leaf(TakeThenFinish::new(1)), leaf(tag("two"))]),
                leaf(tag("three")),
            ]),
        ]);

        let (records, stats) = Executor::new().run(&tree, Record::root()).await.unwrap();

        let count = |t: &str| records.iter().filter(|r| r.text("tag") == Some(t)).count();
        // Siblings yield full output; the pruned branch keeps its partial.
        assert_eq!(count("one"), 2);
        assert_eq!(count("three"), 2);
        assert_eq!(count("two"), 0); // finish hit before the tag stage ran
        assert_eq!(
            records.iter().filter(|r| r.text("tag").is_none()).count(),
            1
        );
        assert_eq!(stats.branches_finished, 1);
    }

    #[tokio::test]
    async fn finish_branch_skips_remaining_sequence_stages() {
        let finisher = FnNode::new("finish", |_r| Err::<Vec<Record>, _>(NodeSignal::FinishBranch));
        let tree = seq([leaf(tag("kept")), leaf(finisher), leaf(tag("never"))]);

        let (records, _stats) = Executor::new().run(&tree, Record::root()).await.unwrap();
        // Partial output of the finishing stage is empty, and the trailing
        // stage never ran.
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn abort_propagates_to_root() {
        let abort = FnNode::new("abort", |_r| {
            Err::<Vec<Record>, _>(AlluviumError::validation("boom").into())
        });
        let tree = seq([leaf(tag("first")), leaf(abort), leaf(tag("never"))]);

        let err = Executor::new()
            .run(&tree, Record::root())
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn finalize_runs_in_reverse_order_of_first_use() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = Recorder {
            name: "first".into(),
            log: log.clone(),
        };
        let second = Recorder {
            name: "second".into(),
            log: log.clone(),
        };
        let tree = seq([leaf(first), leaf(second)]);

        Executor::new().run(&tree, Record::root()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["second", "first"]);
    }

    #[tokio::test]
    async fn shared_node_finalized_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink: Arc<dyn Node> = Arc::new(Recorder {
            name: "sink".into(),
            log: log.clone(),
        });
        let tree = par([shared(sink.clone()), shared(sink.clone())]);

        Executor::new().run(&tree, Record::root()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["sink"]);
    }

    #[tokio::test]
    async fn finalize_skipped_on_abort() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let recorder = Recorder {
            name: "sink".into(),
            log: log.clone(),
        };
        let abort = FnNode::new("abort", |_r| {
            Err::<Vec<Record>, _>(AlluviumError::validation("fatal").into())
        });
        let tree = seq([leaf(recorder), leaf(abort)]);

        let result = Executor::new().run(&tree, Record::root()).await;
        assert!(result.is_err());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn scoped_subtree_passes_input_through() {
        let hits = Arc::new(Mutex::new(0usize));
        let hits_inner = hits.clone();
        let side_effect = emitting("side_effect", move |r: Record| {
            *hits_inner.lock().unwrap() += 1;
            // Output that would pollute the stream if not scoped away.
            vec![r.with("junk", "x"), r.with("junk", "y")]
        });
        let tree = seq([leaf(tag("keep")), scoped(leaf(side_effect))]);

        let (records, _stats) = Executor::new().run(&tree, Record::root()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text("tag"), Some("keep"));
        assert!(!records[0].contains("junk"));
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn cancellation_between_records() {
        let executor = Executor::new();
        let token = executor.cancel_token();
        let canceller = emitting("canceller", move |r: Record| {
            token.cancel();
            vec![r]
        });
        let tree = seq([leaf(canceller), leaf(tag("never"))]);

        let err = executor
            .run(&tree, Record::root())
            .await
            .expect_err("cancelled");
        assert!(matches!(err, AlluviumError::Cancelled));
    }
}
