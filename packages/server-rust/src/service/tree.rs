//! Handler tree: the addressable registry of callables for a process.
//!
//! A service is constructed from a possibly nested definition tree whose
//! leaves are async callables. Before any listening begins the definition is
//! flattened: every node's `index` sub-tree is folded into the node itself,
//! so `{math: {index: {add}}}` becomes `{math: {add}}`. The flattened tree
//! is built once, never mutated afterwards, and shared read-only across all
//! concurrent dispatches.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

/// Result type every handler settles with.
pub type HandlerResult = Result<Value, anyhow::Error>;

/// A registered callable: positional JSON args in, JSON value out.
///
/// This is the strongly typed handle invocation goes through; there is no
/// reflective lookup at call time.
pub type HandlerFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wraps an async closure as a [`HandlerFn`].
pub fn handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}

/// Wraps a synchronous closure as a [`HandlerFn`].
pub fn sync_handler<F>(f: F) -> HandlerFn
where
    F: Fn(Vec<Value>) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(move |args| {
        let out = f(args);
        Box::pin(async move { out })
    })
}

// ---------------------------------------------------------------------------
// HandlerNode / HandlerTree
// ---------------------------------------------------------------------------

/// One entry in a handler tree: a callable leaf or a named sub-tree.
#[derive(Clone)]
pub enum HandlerNode {
    /// A callable leaf. Indivisible: resolution never descends into it.
    Callable(HandlerFn),
    /// A pure naming namespace.
    Tree(HandlerTree),
}

impl fmt::Debug for HandlerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Callable(_) => f.write_str("Callable"),
            Self::Tree(tree) => tree.fmt(f),
        }
    }
}

/// Mapping from name to [`HandlerNode`].
#[derive(Clone, Default)]
pub struct HandlerTree {
    entries: BTreeMap<String, HandlerNode>,
}

impl fmt::Debug for HandlerTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

impl HandlerTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style: adds a callable leaf under `name`.
    #[must_use]
    pub fn with_handler(mut self, name: impl Into<String>, f: HandlerFn) -> Self {
        self.entries.insert(name.into(), HandlerNode::Callable(f));
        self
    }

    /// Builder-style: adds a sub-tree under `name`.
    #[must_use]
    pub fn with_tree(mut self, name: impl Into<String>, tree: HandlerTree) -> Self {
        self.entries.insert(name.into(), HandlerNode::Tree(tree));
        self
    }

    /// Looks up a direct child by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&HandlerNode> {
        self.entries.get(name)
    }

    /// Iterates direct child names in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flattens the tree by collapsing `index` sub-trees into their parents.
    ///
    /// For every node below the root: while a child named `index` exists and
    /// is a sub-tree (a callable named `index` is left alone), its entries
    /// are merged into the node with the node's own entries winning on
    /// collision, and the `index` key is removed. Merging is recursive for
    /// colliding sub-trees. The root's own children are service names and
    /// are never collapsed into the root.
    ///
    /// Idempotent: a tree without `index` sub-trees flattens to itself.
    #[must_use]
    pub fn flatten(&self) -> Self {
        let entries = self
            .entries
            .iter()
            .map(|(name, node)| (name.clone(), flatten_node(node.clone())))
            .collect();
        Self { entries }
    }
}

fn flatten_node(node: HandlerNode) -> HandlerNode {
    match node {
        HandlerNode::Callable(f) => HandlerNode::Callable(f),
        HandlerNode::Tree(mut tree) => {
            // Collapse repeatedly: a merged `index` sub-tree may itself have
            // carried an `index` child.
            while matches!(tree.entries.get("index"), Some(HandlerNode::Tree(_))) {
                if let Some(HandlerNode::Tree(index_tree)) = tree.entries.remove("index") {
                    tree = merge_trees(index_tree, tree);
                }
            }

            let entries = tree
                .entries
                .into_iter()
                .map(|(name, child)| (name, flatten_node(child)))
                .collect();
            HandlerNode::Tree(HandlerTree { entries })
        }
    }
}

/// Merges `overlay` on top of `base`; overlay entries win on collision.
/// Colliding sub-trees merge recursively; any other collision keeps the
/// overlay value whole.
fn merge_trees(base: HandlerTree, overlay: HandlerTree) -> HandlerTree {
    let mut entries = base.entries;
    for (name, overlay_node) in overlay.entries {
        match (entries.remove(&name), overlay_node) {
            (Some(HandlerNode::Tree(base_sub)), HandlerNode::Tree(overlay_sub)) => {
                entries.insert(name, HandlerNode::Tree(merge_trees(base_sub, overlay_sub)));
            }
            (_, node) => {
                entries.insert(name, node);
            }
        }
    }
    HandlerTree { entries }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
