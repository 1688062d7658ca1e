//! The pipeline tree: composition of nodes into sequences and fan-out
//! branches.
//!
//! The tree shape is fixed at construction time (built once per crawl
//! configuration) and never mutated during execution.

use std::sync::Arc;

use crate::node::Node;

/// A pipeline tree.
///
/// - `Leaf` — a single stage.
/// - `Sequence` — strict left-to-right composition: each stage's output
///   sequence becomes the next stage's combined input.
/// - `Parallel` — fan-out: each record entering is independently routed
///   through every subtree, outputs concatenated in declared order.
/// - `Scoped` — runs its subtree for each incoming record but passes the
///   *input* records through unchanged, so side-effecting sub-pipelines can
///   be spliced into a sequence without disturbing the record flow.
#[derive(Clone)]
pub enum Tree {
    Leaf(Arc<dyn Node>),
    Sequence(Vec<Tree>),
    Parallel(Vec<Tree>),
    Scoped(Box<Tree>),
}

/// A leaf holding a freshly constructed node.
pub fn leaf(node: impl Node + 'static) -> Tree {
    Tree::Leaf(Arc::new(node))
}

/// A leaf holding an already-shared node instance. Use this to place the
/// same stateful node at several tree positions on purpose.
pub fn shared(node: Arc<dyn Node>) -> Tree {
    Tree::Leaf(node)
}

/// Strict sequential composition.
pub fn seq(children: impl IntoIterator<Item = Tree>) -> Tree {
    Tree::Sequence(children.into_iter().collect())
}

/// Fan-out composition.
pub fn par(children: impl IntoIterator<Item = Tree>) -> Tree {
    Tree::Parallel(children.into_iter().collect())
}

/// Pass-through sub-pipeline.
pub fn scoped(child: Tree) -> Tree {
    Tree::Scoped(Box::new(child))
}

impl Tree {
    /// Number of leaves in the tree.
    pub fn len(&self) -> usize {
        match self {
            Self::Leaf(_) => 1,
            Self::Sequence(children) | Self::Parallel(children) => {
                children.iter().map(Tree::len).sum()
            }
            Self::Scoped(child) => child.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Leaf(node) => write!(f, "{}", node.name()),
            Self::Sequence(children) => f.debug_list().entries(children).finish(),
            Self::Parallel(children) => {
                write!(f, "par")?;
                f.debug_set().entries(children).finish()
            }
            Self::Scoped(child) => {
                write!(f, "scoped(")?;
                child.fmt(f)?;
                write!(f, ")")
            }
        }
    }
}
