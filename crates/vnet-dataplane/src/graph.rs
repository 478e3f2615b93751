//! Node Graph
//!
//! Owns every registered node, the error fabric and the buffer pool, and
//! runs one node callback per dispatch call with the batch shape its kind
//! needs.
//!
//! # Design
//!
//! - Nodes get a stable [`NodeIndex`] in registration order
//! - Next edges and dependencies are names until [`Graph::finalize`]
//!   resolves them; unknown names fail there
//! - Per-thread enqueue caches live in the node entry, grown on first use
//!   of a thread id; ids at or above `max_threads` are rejected as stale
//! - Each thread's error shard is looked up once and kept by the graph
//! - Each dispatch is guarded: a [fault](VnetError::is_fault) is logged,
//!   the batch dropped, and the caller gets [`Dispatch::Dropped`]
//!
//! The scheduler that decides which node runs when is not part of this
//! module.

use crate::buffer::BufferPool;
use crate::config::DataplaneConfig;
use crate::counters::{ErrorDropNode, ErrorFabric, ErrorRef, ErrorReport, ErrorThread};
use crate::enqueue::{Enqueue, EnqueueOut};
use crate::node::{NextEdge, NodeContext, NodeIndex, NodeKind, NodeRegistration};
use crate::stats::{NodeStats, NodeStatsSnapshot};
use crate::vector::{RefIn, RefOut, INVALID_THREAD};
use crate::{VnetError, VnetResult};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name of the built-in error drop node
pub const DROP_NODE: &str = "drop";

/// Outcome of one dispatch call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Done,
    /// Node faulted; its batch was discarded
    Dropped { refs: usize },
}

struct NodeEntry {
    name: String,
    kind: NodeKind,
    error_refs: Vec<ErrorRef>,
    nexts: Vec<NextEdge>,
    depends_on: Vec<String>,
    deps: Vec<NodeIndex>,
    /// Indexed by thread id
    enqueues: Vec<Enqueue>,
    stats: NodeStats,
}

/// Forwarding graph
pub struct Graph {
    config: DataplaneConfig,
    pool: Arc<BufferPool>,
    errors: ErrorFabric,
    /// Error shards by thread id
    shards: Vec<Option<Arc<ErrorThread>>>,
    nodes: Vec<NodeEntry>,
    by_name: HashMap<String, NodeIndex>,
    order: Vec<NodeIndex>,
    finalized: bool,
}

impl Graph {
    /// Create a graph holding only the built-in `drop` node
    pub fn new(config: DataplaneConfig, pool: Arc<BufferPool>) -> Self {
        let errors = ErrorFabric::new(config.event_log, config.error_threads);
        let mut graph = Self {
            config,
            pool,
            errors,
            shards: Vec::new(),
            nodes: Vec::new(),
            by_name: HashMap::new(),
            order: Vec::new(),
            finalized: false,
        };
        graph.insert(NodeRegistration::output(DROP_NODE, ErrorDropNode));
        graph
    }

    fn insert(&mut self, reg: NodeRegistration) -> NodeIndex {
        let index = NodeIndex(self.nodes.len());
        let error_refs = reg
            .errors
            .iter()
            .map(|s| {
                if s.is_empty() {
                    ErrorRef::INVALID
                } else {
                    self.errors.new_error(&reg.name, s)
                }
            })
            .collect::<Vec<_>>();
        let nexts = reg
            .nexts
            .into_iter()
            .map(|name| NextEdge { name, target: None })
            .collect::<Vec<_>>();

        debug!(
            node = %reg.name,
            index = index.0,
            kind = reg.kind.name(),
            errors = error_refs.len(),
            nexts = nexts.len(),
            "registered node"
        );

        self.by_name.insert(reg.name.clone(), index);
        self.nodes.push(NodeEntry {
            name: reg.name,
            kind: reg.kind,
            error_refs,
            nexts,
            depends_on: reg.depends_on,
            deps: Vec::new(),
            enqueues: Vec::new(),
            stats: NodeStats::default(),
        });
        self.finalized = false;
        index
    }

    /// Add a node. Its declared errors are allocated immediately.
    pub fn register(&mut self, reg: NodeRegistration) -> VnetResult<NodeIndex> {
        if self.by_name.contains_key(&reg.name) {
            return Err(VnetError::DuplicateNode(reg.name));
        }
        Ok(self.insert(reg))
    }

    fn entry(&self, node: NodeIndex) -> VnetResult<&NodeEntry> {
        self.nodes.get(node.0).ok_or(VnetError::UnknownNode(node.0))
    }

    fn entry_mut(&mut self, node: NodeIndex) -> VnetResult<&mut NodeEntry> {
        self.nodes.get_mut(node.0).ok_or(VnetError::UnknownNode(node.0))
    }

    /// Add a next edge by name, returning its next index. An edge already
    /// present keeps its index.
    pub fn add_named_next(&mut self, node: NodeIndex, next: &str) -> VnetResult<usize> {
        let target = self.by_name.get(next).copied();
        let entry = self.entry_mut(node)?;
        if let Some(i) = entry.nexts.iter().position(|e| e.name == next) {
            return Ok(i);
        }
        entry.nexts.push(NextEdge {
            name: next.to_string(),
            target,
        });
        let i = entry.nexts.len() - 1;
        if target.is_none() {
            self.finalized = false;
        }
        Ok(i)
    }

    /// Resolve next edges and dependencies, then order nodes so every node
    /// comes after its dependencies
    pub fn finalize(&mut self) -> VnetResult<()> {
        let by_name = &self.by_name;
        for entry in &mut self.nodes {
            for edge in &mut entry.nexts {
                let target = by_name.get(&edge.name).ok_or_else(|| VnetError::UnknownNext {
                    node: entry.name.clone(),
                    next: edge.name.clone(),
                })?;
                edge.target = Some(*target);
            }
            entry.deps = entry
                .depends_on
                .iter()
                .map(|dep| {
                    by_name.get(dep).copied().ok_or_else(|| VnetError::UnknownDependency {
                        node: entry.name.clone(),
                        dep: dep.clone(),
                    })
                })
                .collect::<VnetResult<_>>()?;
        }

        let n = self.nodes.len();
        let mut pending: Vec<usize> = self.nodes.iter().map(|e| e.deps.len()).collect();
        let mut dependents = vec![Vec::new(); n];
        for (i, entry) in self.nodes.iter().enumerate() {
            for dep in &entry.deps {
                dependents[dep.0].push(i);
            }
        }
        let mut ready: VecDeque<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = ready.pop_front() {
            order.push(NodeIndex(i));
            for &d in &dependents[i] {
                pending[d] -= 1;
                if pending[d] == 0 {
                    ready.push_back(d);
                }
            }
        }
        if order.len() != n {
            let stuck = pending.iter().position(|&p| p > 0).unwrap_or(0);
            return Err(VnetError::DependencyCycle(self.nodes[stuck].name.clone()));
        }

        info!(nodes = n, errors = self.errors.len(), "graph finalized");
        self.order = order;
        self.finalized = true;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Dependency order computed by the last `finalize`
    pub fn order(&self) -> &[NodeIndex] {
        &self.order
    }

    pub fn node_index(&self, name: &str) -> Option<NodeIndex> {
        self.by_name.get(name).copied()
    }

    pub fn node_name(&self, node: NodeIndex) -> Option<&str> {
        self.nodes.get(node.0).map(|e| e.name.as_str())
    }

    /// Index of the built-in drop node
    pub fn drop_node(&self) -> NodeIndex {
        NodeIndex(0)
    }

    /// Node that next edge `next` of `node` leads to, once resolved
    pub fn next_target(&self, node: NodeIndex, next: usize) -> Option<NodeIndex> {
        self.nodes.get(node.0)?.nexts.get(next)?.target
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Output batch sized for the nexts of `node`
    pub fn new_ref_out(&self, node: NodeIndex, thread_id: usize) -> VnetResult<RefOut> {
        Ok(RefOut::new(thread_id, self.entry(node)?.nexts.len()))
    }

    /// Run an input node
    pub fn node_input(&mut self, node: NodeIndex, out: &mut RefOut) -> VnetResult<Dispatch> {
        let Graph {
            config,
            pool,
            errors,
            shards,
            nodes,
            ..
        } = self;
        let entry = nodes.get_mut(node.0).ok_or(VnetError::UnknownNode(node.0))?;
        let NodeEntry {
            name,
            kind,
            error_refs,
            nexts,
            stats,
            ..
        } = entry;

        let NodeKind::Input(n) = kind else {
            return Err(kind_mismatch(name, kind, "input"));
        };
        let thread_id = out.thread_id();
        let result = if let Err(e) = check_thread(config, thread_id) {
            Err(e)
        } else {
            if out.n_next() < nexts.len() {
                out.validate_next(nexts.len() - 1);
            }
            let cx = NodeContext {
                index: node,
                name,
                thread_id,
                error_refs,
                nexts,
                errors,
                error_thread: shard(errors, shards, thread_id),
                pool,
                config,
            };
            n.node_input(&cx, out)
        };

        match result {
            Ok(()) => {
                stats.record_call(out.total_len());
                Ok(Dispatch::Done)
            }
            Err(e) if e.is_fault() => {
                let refs = out.total_len();
                out.clear();
                Ok(contain(name, stats, &e, refs))
            }
            Err(e) => Err(e),
        }
    }

    /// Run an output node. The input batch is empty afterwards.
    pub fn node_output(&mut self, node: NodeIndex, input: &mut RefIn) -> VnetResult<Dispatch> {
        let Graph {
            config,
            pool,
            errors,
            shards,
            nodes,
            ..
        } = self;
        let entry = nodes.get_mut(node.0).ok_or(VnetError::UnknownNode(node.0))?;
        let NodeEntry {
            name,
            kind,
            error_refs,
            nexts,
            stats,
            ..
        } = entry;

        let NodeKind::Output(n) = kind else {
            return Err(kind_mismatch(name, kind, "output"));
        };
        let in_len = input.len();
        let thread_id = input.thread_id();
        let result = if let Err(e) = check_thread(config, thread_id) {
            Err(e)
        } else {
            let cx = NodeContext {
                index: node,
                name,
                thread_id,
                error_refs,
                nexts,
                errors,
                error_thread: shard(errors, shards, thread_id),
                pool,
                config,
            };
            n.node_output(&cx, input)
        };
        input.refs.clear();

        match result {
            Ok(()) => {
                stats.record_call(in_len);
                Ok(Dispatch::Done)
            }
            Err(e) if e.is_fault() => Ok(contain(name, stats, &e, in_len)),
            Err(e) => Err(e),
        }
    }

    /// Run an input-output node through its per-thread enqueue cache. On
    /// success the input batch is empty and every reference sits in one of
    /// the node's next vectors.
    pub fn node_input_output(
        &mut self,
        node: NodeIndex,
        input: &mut RefIn,
        out: &mut RefOut,
    ) -> VnetResult<Dispatch> {
        let Graph {
            config,
            pool,
            errors,
            shards,
            nodes,
            ..
        } = self;
        let entry = nodes.get_mut(node.0).ok_or(VnetError::UnknownNode(node.0))?;
        let NodeEntry {
            name,
            kind,
            error_refs,
            nexts,
            enqueues,
            stats,
            ..
        } = entry;

        let NodeKind::InputOutput(n) = kind else {
            return Err(kind_mismatch(name, kind, "input-output"));
        };
        let in_len = input.len();
        let thread_id = input.thread_id();
        let result = if let Err(e) = check_thread(config, thread_id) {
            Err(e)
        } else {
            if enqueues.len() <= thread_id {
                enqueues.resize(thread_id + 1, Enqueue::default());
            }
            if out.n_next() < nexts.len() {
                out.validate_next(nexts.len() - 1);
            }
            let cx = NodeContext {
                index: node,
                name,
                thread_id,
                error_refs,
                nexts,
                errors,
                error_thread: shard(errors, shards, thread_id),
                pool,
                config,
            };
            let mut eo = EnqueueOut::new(&mut enqueues[thread_id], out);
            n.node_input_output(&cx, input, &mut eo).and_then(|()| {
                eo.sync();
                eo.validate(in_len, config.invariant_checks)
            })
        };

        match result {
            Ok(()) => {
                input.refs.clear();
                stats.record_call(in_len);
                Ok(Dispatch::Done)
            }
            Err(e) if e.is_fault() => {
                input.refs.clear();
                out.clear();
                Ok(contain(name, stats, &e, in_len))
            }
            Err(e) => Err(e),
        }
    }

    /// Output node asks the scheduler to hold back its input
    pub fn is_suspended(&self, node: NodeIndex) -> bool {
        match self.nodes.get(node.0).map(|e| &e.kind) {
            Some(NodeKind::Output(n)) => n.is_suspended(),
            _ => false,
        }
    }

    /// Declare one more error for `node`, returning its error ref
    pub fn new_error(&mut self, node: NodeIndex, text: &str) -> VnetResult<ErrorRef> {
        let Graph { errors, nodes, .. } = self;
        let entry = nodes.get_mut(node.0).ok_or(VnetError::UnknownNode(node.0))?;
        let e = errors.new_error(&entry.name, text);
        entry.error_refs.push(e);
        Ok(e)
    }

    /// Count `n` occurrences of the `local`-th error of `node` from any
    /// thread
    pub fn count_error(&self, node: NodeIndex, local: usize, n: u64) -> VnetResult<()> {
        let entry = self.entry(node)?;
        let e = entry
            .error_refs
            .get(local)
            .copied()
            .ok_or_else(|| VnetError::UnknownError {
                node: entry.name.clone(),
                index: local,
            })?;
        if e.is_valid() {
            self.errors.count_atomic(e, n);
        }
        Ok(())
    }

    /// Error ref of the `local`-th error of `node`
    pub fn error_ref(&self, node: NodeIndex, local: usize) -> Option<ErrorRef> {
        self.nodes.get(node.0)?.error_refs.get(local).copied()
    }

    pub fn clear_errors(&self) {
        self.errors.clear();
    }

    pub fn show_errors(&self) -> ErrorReport {
        self.errors.show()
    }

    pub fn errors(&self) -> &ErrorFabric {
        &self.errors
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn config(&self) -> &DataplaneConfig {
        &self.config
    }

    pub fn node_stats(&self, node: NodeIndex) -> Option<NodeStatsSnapshot> {
        self.nodes.get(node.0).map(|e| e.stats.snapshot())
    }
}

fn kind_mismatch(name: &str, kind: &NodeKind, wanted: &'static str) -> VnetError {
    VnetError::KindMismatch {
        node: name.to_string(),
        kind: kind.name(),
        wanted,
    }
}

/// Batches name their thread; ids past the configured bound are as stale
/// as an invalidated one
fn check_thread(config: &DataplaneConfig, thread_id: usize) -> VnetResult<()> {
    if thread_id == INVALID_THREAD || thread_id >= config.max_threads {
        return Err(VnetError::StaleThread);
    }
    Ok(())
}

/// Error shard of `thread_id`, fetched from the fabric on first use
fn shard<'s>(
    errors: &ErrorFabric,
    shards: &'s mut Vec<Option<Arc<ErrorThread>>>,
    thread_id: usize,
) -> &'s ErrorThread {
    if shards.len() <= thread_id {
        shards.resize(thread_id + 1, None);
    }
    &**shards[thread_id].get_or_insert_with(|| errors.thread(thread_id))
}

fn contain(name: &str, stats: &NodeStats, e: &VnetError, refs: usize) -> Dispatch {
    stats.record_fault();
    warn!(node = %name, error = %e, refs, "dispatch fault, batch dropped");
    Dispatch::Dropped { refs }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Ref;
    use crate::node::{InputNode, InputOutputNode, NodeContext, OutputNode};
    use parking_lot::Mutex;

    const KEEP: usize = 0;
    const DROP: usize = 1;

    /// Sends refs whose buffer index is listed as bad to `drop`
    struct Checksum {
        bad: Vec<u32>,
    }

    impl InputOutputNode for Checksum {
        fn node_input_output(
            &mut self,
            cx: &NodeContext<'_>,
            input: &mut RefIn,
            out: &mut EnqueueOut<'_>,
        ) -> VnetResult<()> {
            for r in input.refs.as_mut_slice() {
                if self.bad.contains(&r.buffer()) {
                    cx.set_error(r, 0);
                    out.put1(*r, DROP);
                } else {
                    out.put1(*r, KEEP);
                }
            }
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<Ref>>>);

    impl OutputNode for Sink {
        fn node_output(&mut self, _cx: &NodeContext<'_>, input: &mut RefIn) -> VnetResult<()> {
            self.0.lock().extend_from_slice(input.refs.as_slice());
            Ok(())
        }
    }

    struct Faulty;

    impl InputOutputNode for Faulty {
        fn node_input_output(
            &mut self,
            _cx: &NodeContext<'_>,
            input: &mut RefIn,
            out: &mut EnqueueOut<'_>,
        ) -> VnetResult<()> {
            out.redirect(input, 0);
            Err(VnetError::Fault("interface deleted".into()))
        }
    }

    /// Forwards every ref twice
    struct Doubler;

    impl InputOutputNode for Doubler {
        fn node_input_output(
            &mut self,
            _cx: &NodeContext<'_>,
            input: &mut RefIn,
            out: &mut EnqueueOut<'_>,
        ) -> VnetResult<()> {
            out.redirect(input, 0);
            out.redirect(input, 0);
            Ok(())
        }
    }

    struct Generator(u32);

    impl InputNode for Generator {
        fn node_input(&mut self, _cx: &NodeContext<'_>, out: &mut RefOut) -> VnetResult<()> {
            for i in 0..self.0 {
                out.outs[0].push(Ref::new(i, 0, 60));
            }
            Ok(())
        }
    }

    fn graph() -> Graph {
        let config = DataplaneConfig {
            invariant_checks: true,
            ..Default::default()
        };
        Graph::new(config, Arc::new(BufferPool::new("test", 64)))
    }

    #[test]
    fn test_checksum_scenario() {
        let pool = Arc::new(BufferPool::new("test", 64));
        let mut refs = vec![Ref::default(); 6];
        pool.alloc_refs(&mut refs).unwrap();
        let bad = vec![refs[1].buffer(), refs[3].buffer()];

        let mut g = Graph::new(DataplaneConfig::default(), pool);
        let check = g
            .register(
                NodeRegistration::input_output("check", Checksum { bad })
                    .errors(["bad-checksum"])
                    .nexts(["keep", DROP_NODE]),
            )
            .unwrap();
        let sink = Sink::default();
        g.register(NodeRegistration::output("keep", sink.clone())).unwrap();
        g.finalize().unwrap();

        let mut input = RefIn::from_refs(0, refs.clone());
        let mut out = g.new_ref_out(check, 0).unwrap();
        assert_eq!(g.node_input_output(check, &mut input, &mut out).unwrap(), Dispatch::Done);
        assert!(input.is_empty());
        assert_eq!(out.outs[KEEP].len(), 4);
        assert_eq!(out.outs[DROP].len(), 2);

        let mut dropped = out.take_next(DROP);
        assert_eq!(g.next_target(check, DROP), Some(g.drop_node()));
        g.node_output(g.drop_node(), &mut dropped).unwrap();

        let report = g.show_errors();
        assert_eq!(report.get("check", "bad-checksum"), 2);
        assert_eq!(report.0.len(), 1);
        assert_eq!(g.pool().allocated(), 4);

        let mut kept = out.take_next(KEEP);
        g.node_output(g.node_index("keep").unwrap(), &mut kept).unwrap();
        let seen: Vec<u32> = sink.0.lock().iter().map(|r| r.buffer()).collect();
        let want: Vec<u32> = [0, 2, 4, 5].iter().map(|&i| refs[i].buffer()).collect();
        assert_eq!(seen, want);
    }

    #[test]
    fn test_duplicate_node() {
        let mut g = graph();
        assert!(matches!(
            g.register(NodeRegistration::output(DROP_NODE, Sink::default())),
            Err(VnetError::DuplicateNode(_))
        ));
    }

    #[test]
    fn test_unknown_next_and_dependency() {
        let mut g = graph();
        g.register(NodeRegistration::input_output("a", Doubler).nexts(["nowhere"]))
            .unwrap();
        assert!(matches!(g.finalize(), Err(VnetError::UnknownNext { .. })));

        let mut g = graph();
        g.register(NodeRegistration::output("a", Sink::default()).depends_on(["ghost"]))
            .unwrap();
        assert!(matches!(g.finalize(), Err(VnetError::UnknownDependency { .. })));
    }

    #[test]
    fn test_order_and_cycle() {
        let mut g = graph();
        let c = g
            .register(NodeRegistration::output("c", Sink::default()).depends_on(["b"]))
            .unwrap();
        let b = g
            .register(NodeRegistration::output("b", Sink::default()).depends_on(["a"]))
            .unwrap();
        let a = g.register(NodeRegistration::output("a", Sink::default())).unwrap();
        g.finalize().unwrap();

        let pos = |n: NodeIndex| g.order().iter().position(|&x| x == n).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(b) < pos(c));

        let mut g = graph();
        g.register(NodeRegistration::output("x", Sink::default()).depends_on(["y"]))
            .unwrap();
        g.register(NodeRegistration::output("y", Sink::default()).depends_on(["x"]))
            .unwrap();
        assert!(matches!(g.finalize(), Err(VnetError::DependencyCycle(_))));
    }

    #[test]
    fn test_add_named_next() {
        let mut g = graph();
        let a = g.register(NodeRegistration::input_output("a", Doubler)).unwrap();
        assert_eq!(g.add_named_next(a, DROP_NODE).unwrap(), 0);
        assert_eq!(g.add_named_next(a, "later").unwrap(), 1);
        assert_eq!(g.add_named_next(a, DROP_NODE).unwrap(), 0);

        assert!(g.finalize().is_err());
        g.register(NodeRegistration::output("later", Sink::default())).unwrap();
        g.finalize().unwrap();
        assert_eq!(g.next_target(a, 1), g.node_index("later"));
    }

    #[test]
    fn test_kind_mismatch() {
        let mut g = graph();
        let mut out = RefOut::new(0, 1);
        assert!(matches!(
            g.node_input(g.drop_node(), &mut out),
            Err(VnetError::KindMismatch { wanted: "input", .. })
        ));
    }

    #[test]
    fn test_fault_is_contained() {
        let mut g = graph();
        let f = g
            .register(NodeRegistration::input_output("faulty", Faulty).nexts([DROP_NODE]))
            .unwrap();
        let mut input = RefIn::from_refs(0, vec![Ref::new(1, 0, 0); 3]);
        let mut out = g.new_ref_out(f, 0).unwrap();
        assert_eq!(
            g.node_input_output(f, &mut input, &mut out).unwrap(),
            Dispatch::Dropped { refs: 3 }
        );
        assert_eq!(out.total_len(), 0);
        assert_eq!(g.node_stats(f).unwrap().faults, 1);
    }

    #[test]
    fn test_stale_thread_is_contained() {
        let mut g = graph();
        let mut input = RefIn::from_refs(0, vec![Ref::new(1, 0, 0); 2]);
        input.invalidate();
        assert_eq!(
            g.node_output(g.drop_node(), &mut input).unwrap(),
            Dispatch::Dropped { refs: 2 }
        );
        assert!(input.is_empty());
    }

    #[test]
    fn test_foreign_buffer_is_contained() {
        let mut g = Graph::new(DataplaneConfig::default(), Arc::new(BufferPool::new("small", 8)));
        let e = g.errors().new_error("check", "bad-checksum");
        let good = {
            let mut r = g.pool().alloc().unwrap();
            r.set_error(e);
            r
        };
        let mut bad = Ref::new(1000, 0, 0);
        bad.set_error(e);

        let mut input = RefIn::from_refs(0, vec![good, bad]);
        assert_eq!(
            g.node_output(g.drop_node(), &mut input).unwrap(),
            Dispatch::Dropped { refs: 2 }
        );
        assert!(input.is_empty());
        assert!(g.show_errors().is_empty());
        assert_eq!(g.pool().allocated(), 1);
        assert_eq!(g.node_stats(g.drop_node()).unwrap().faults, 1);

        // The dispatch thread carries on with the next batch.
        let mut input = RefIn::from_refs(0, vec![good]);
        assert_eq!(g.node_output(g.drop_node(), &mut input).unwrap(), Dispatch::Done);
        assert_eq!(g.errors().since_clear(e), 1);
        assert_eq!(g.pool().allocated(), 0);
    }

    #[test]
    fn test_thread_id_past_bound_is_stale() {
        let mut g = graph();
        let max = g.config().max_threads;
        let mut input = RefIn::from_refs(max, vec![Ref::new(1, 0, 0); 2]);
        assert_eq!(
            g.node_output(g.drop_node(), &mut input).unwrap(),
            Dispatch::Dropped { refs: 2 }
        );

        let d = g
            .register(NodeRegistration::input_output("double", Doubler).nexts([DROP_NODE]))
            .unwrap();
        let mut input = RefIn::from_refs(usize::MAX / 2, vec![Ref::new(1, 0, 0); 1]);
        let mut out = g.new_ref_out(d, usize::MAX / 2).unwrap();
        assert_eq!(
            g.node_input_output(d, &mut input, &mut out).unwrap(),
            Dispatch::Dropped { refs: 1 }
        );

        let gen = g
            .register(NodeRegistration::input("gen", Generator(3)).nexts([DROP_NODE]))
            .unwrap();
        let mut out = g.new_ref_out(gen, max + 1).unwrap();
        assert_eq!(g.node_input(gen, &mut out).unwrap(), Dispatch::Dropped { refs: 0 });
        assert_eq!(out.total_len(), 0);
    }

    #[test]
    fn test_output_overflow_checked() {
        let mut g = graph();
        let d = g
            .register(NodeRegistration::input_output("double", Doubler).nexts([DROP_NODE]))
            .unwrap();
        let mut input = RefIn::from_refs(0, vec![Ref::new(1, 0, 0); 2]);
        let mut out = g.new_ref_out(d, 0).unwrap();
        assert!(matches!(
            g.node_input_output(d, &mut input, &mut out),
            Err(VnetError::OutputOverflow { out_len: 4, in_len: 2 })
        ));

        let mut g = Graph::new(
            DataplaneConfig {
                invariant_checks: false,
                ..Default::default()
            },
            Arc::new(BufferPool::new("test", 8)),
        );
        let d = g
            .register(NodeRegistration::input_output("double", Doubler).nexts([DROP_NODE]))
            .unwrap();
        let mut input = RefIn::from_refs(0, vec![Ref::new(1, 0, 0); 2]);
        let mut out = g.new_ref_out(d, 0).unwrap();
        assert_eq!(g.node_input_output(d, &mut input, &mut out).unwrap(), Dispatch::Done);
    }

    #[test]
    fn test_input_node_and_count_error() {
        let mut g = graph();
        let gen = g
            .register(
                NodeRegistration::input("gen", Generator(5))
                    .errors(["", "no buffers"])
                    .nexts([DROP_NODE]),
            )
            .unwrap();
        let mut out = g.new_ref_out(gen, 1).unwrap();
        g.node_input(gen, &mut out).unwrap();
        assert_eq!(out.outs[0].len(), 5);
        assert_eq!(g.node_stats(gen).unwrap().refs, 5);

        assert_eq!(g.error_ref(gen, 0), Some(ErrorRef::INVALID));
        g.count_error(gen, 0, 1).unwrap();
        g.count_error(gen, 1, 3).unwrap();
        assert!(matches!(g.count_error(gen, 2, 1), Err(VnetError::UnknownError { .. })));
        assert_eq!(g.show_errors().get("gen", "no buffers"), 3);

        let late = g.new_error(gen, "late").unwrap();
        g.count_error(gen, 2, 1).unwrap();
        assert_eq!(g.errors().since_clear(late), 1);

        g.clear_errors();
        assert!(g.show_errors().is_empty());
    }
}
