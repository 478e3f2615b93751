//! Graph Nodes
//!
//! A node is one stage of the forwarding graph. It is exactly one of three
//! shapes, and the dispatch runtime builds the batches that shape needs:
//!
//! | Kind          | Receives | Produces                 |
//! |---------------|----------|--------------------------|
//! | `Input`       | nothing  | `RefOut`                 |
//! | `Output`      | `RefIn`  | nothing                  |
//! | `InputOutput` | `RefIn`  | `RefOut` via the enqueue |
//!
//! Callbacks run to completion on the dispatch thread and must not block.
//! They report per-batch trouble by returning an error; see
//! [`VnetError::is_fault`](crate::VnetError::is_fault).

use crate::buffer::{BufferPool, Ref};
use crate::config::DataplaneConfig;
use crate::counters::{ErrorFabric, ErrorRef, ErrorThread};
use crate::enqueue::EnqueueOut;
use crate::vector::{RefIn, RefOut};
use crate::VnetResult;
use std::fmt;

/// Stable index of a registered node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(pub usize);

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node producing references from nothing (e.g. a receive ring)
pub trait InputNode: Send {
    fn node_input(&mut self, cx: &NodeContext<'_>, out: &mut RefOut) -> VnetResult<()>;
}

/// Terminal node consuming references (e.g. transmit, drop)
pub trait OutputNode: Send {
    fn node_output(&mut self, cx: &NodeContext<'_>, input: &mut RefIn) -> VnetResult<()>;

    /// Scheduler should hold back further input this round
    fn is_suspended(&self) -> bool {
        false
    }
}

/// Node forwarding each input reference to one of its nexts
pub trait InputOutputNode: Send {
    fn node_input_output(
        &mut self,
        cx: &NodeContext<'_>,
        input: &mut RefIn,
        out: &mut EnqueueOut<'_>,
    ) -> VnetResult<()>;
}

/// Node callbacks tagged by shape
pub enum NodeKind {
    Input(Box<dyn InputNode>),
    Output(Box<dyn OutputNode>),
    InputOutput(Box<dyn InputOutputNode>),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Input(_) => "input",
            NodeKind::Output(_) => "output",
            NodeKind::InputOutput(_) => "input-output",
        }
    }
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything needed to add a node to a graph
#[derive(Debug)]
pub struct NodeRegistration {
    pub name: String,
    pub kind: NodeKind,
    /// Error strings; local index i becomes the node's i-th error ref
    pub errors: Vec<String>,
    /// Next node names; position is the next index
    pub nexts: Vec<String>,
    /// Nodes that must precede this one
    pub depends_on: Vec<String>,
}

impl NodeRegistration {
    fn with_kind(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            errors: Vec::new(),
            nexts: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn input(name: impl Into<String>, node: impl InputNode + 'static) -> Self {
        Self::with_kind(name, NodeKind::Input(Box::new(node)))
    }

    pub fn output(name: impl Into<String>, node: impl OutputNode + 'static) -> Self {
        Self::with_kind(name, NodeKind::Output(Box::new(node)))
    }

    pub fn input_output(name: impl Into<String>, node: impl InputOutputNode + 'static) -> Self {
        Self::with_kind(name, NodeKind::InputOutput(Box::new(node)))
    }

    pub fn errors<I, S>(mut self, errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.errors.extend(errors.into_iter().map(Into::into));
        self
    }

    pub fn nexts<I, S>(mut self, nexts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nexts.extend(nexts.into_iter().map(Into::into));
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }
}

/// Named edge to a downstream node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextEdge {
    pub name: String,
    /// Resolved at finalize
    pub target: Option<NodeIndex>,
}

/// Per-call view of the graph handed to node callbacks
pub struct NodeContext<'a> {
    pub(crate) index: NodeIndex,
    pub(crate) name: &'a str,
    pub(crate) thread_id: usize,
    pub(crate) error_refs: &'a [ErrorRef],
    pub(crate) nexts: &'a [NextEdge],
    pub(crate) errors: &'a ErrorFabric,
    /// Error shard of `thread_id`
    pub(crate) error_thread: &'a ErrorThread,
    pub(crate) pool: &'a BufferPool,
    pub(crate) config: &'a DataplaneConfig,
}

impl<'a> NodeContext<'a> {
    pub fn index(&self) -> NodeIndex {
        self.index
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    /// Error ref of this node's `i`-th declared error
    #[inline]
    pub fn error_ref(&self, i: usize) -> ErrorRef {
        self.error_refs.get(i).copied().unwrap_or(ErrorRef::INVALID)
    }

    /// Tag `r` with this node's `i`-th error
    #[inline]
    pub fn set_error(&self, r: &mut Ref, i: usize) {
        r.set_error(self.error_ref(i));
    }

    /// Count `n` occurrences of this node's `i`-th error
    pub fn count_error(&self, i: usize, n: u64) {
        let e = self.error_ref(i);
        if e.is_valid() {
            self.errors.count_atomic(e, n);
        }
    }

    /// Count each of `refs` against the error ref in its aux word, on
    /// this thread's shard
    #[inline]
    pub fn count_refs(&self, refs: &[Ref]) {
        self.errors.count_thread_refs(self.error_thread, refs);
    }

    /// Next index of the edge named `name`
    pub fn next_index(&self, name: &str) -> Option<usize> {
        self.nexts.iter().position(|e| e.name == name)
    }

    pub fn n_next(&self) -> usize {
        self.nexts.len()
    }

    pub fn errors(&self) -> &'a ErrorFabric {
        self.errors
    }

    pub fn pool(&self) -> &'a BufferPool {
        self.pool
    }

    pub fn config(&self) -> &'a DataplaneConfig {
        self.config
    }
}
