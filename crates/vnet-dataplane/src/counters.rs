//! Error Counter Fabric
//!
//! Per-thread sharded error counters keyed by [`ErrorRef`].
//!
//! # Design
//!
//! - One shard per thread id, allocated on first touch, never freed
//! - Counters live in fixed-size chunks allocated on first use; a chunk
//!   never moves, so counting takes no lock
//! - The dispatch thread holds its shard, so the batch path never looks
//!   the shard up
//! - Batch counting coalesces runs of one error code in a 1-slot cache
//!   before touching the counter array
//! - Every increment is an atomic add, so the owning thread's batched path
//!   and the foreign-thread single increment never lose counts
//! - `clear` snapshots instead of zeroing; reports subtract the snapshot

use crate::buffer::Ref;
use crate::node::{NodeContext, OutputNode};
use crate::vector::RefIn;
use crate::VnetResult;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::Level;

/// Counters per chunk
const CHUNK_LEN: usize = 256;

/// Errors one shard can count
pub const MAX_ERRORS: usize = 1024 * CHUNK_LEN;

/// Process-wide identifier of one (node, error string) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorRef(u32);

impl ErrorRef {
    /// Declared with an empty string; never counted
    pub const INVALID: Self = ErrorRef(u32::MAX);

    /// Marker for refs whose error was never set
    pub const POISON: Self = ErrorRef(0xfeed_face);

    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Read an error ref back out of a reference's aux word
    #[inline(always)]
    pub fn from_aux(aux: u32) -> Self {
        ErrorRef(aux)
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for ErrorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct ErrorString {
    node: String,
    text: String,
}

/// Counters owned by one thread
pub struct ErrorThread {
    chunks: Box<[OnceLock<Box<[AtomicU64]>>]>,
    /// Only touched by `clear` and reports
    counts_last_clear: Mutex<Vec<u64>>,
    /// Error ref absorbing the current run in `count_refs`
    cache: AtomicU32,
}

impl Default for ErrorThread {
    fn default() -> Self {
        Self {
            chunks: (0..MAX_ERRORS / CHUNK_LEN).map(|_| OnceLock::new()).collect(),
            counts_last_clear: Mutex::new(Vec::new()),
            cache: AtomicU32::new(0),
        }
    }
}

impl fmt::Debug for ErrorThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorThread")
            .field("chunks", &self.chunks.iter().filter(|c| c.get().is_some()).count())
            .field("cache", &self.cache.load(Ordering::Relaxed))
            .finish()
    }
}

impl ErrorThread {
    #[inline(always)]
    fn counter(&self, i: usize) -> Option<&AtomicU64> {
        self.chunks.get(i / CHUNK_LEN)?.get()?.get(i % CHUNK_LEN)
    }

    /// Allocate the chunk holding counter `i`
    #[cold]
    fn grow(&self, i: usize) -> Option<&AtomicU64> {
        self.chunks
            .get(i / CHUNK_LEN)?
            .get_or_init(|| (0..CHUNK_LEN).map(|_| AtomicU64::new(0)).collect())
            .get(i % CHUNK_LEN)
    }

    fn load(&self, i: usize) -> u64 {
        self.counter(i).map_or(0, |c| c.load(Ordering::Relaxed))
    }

    fn since_clear(&self, i: usize) -> u64 {
        let last = self.counts_last_clear.lock().get(i).copied().unwrap_or(0);
        self.load(i).saturating_sub(last)
    }

    fn clear(&self, n_errors: usize) {
        let mut last = self.counts_last_clear.lock();
        last.clear();
        last.extend((0..n_errors).map(|i| self.load(i)));
    }
}

/// Error registry and per-thread counters
#[derive(Debug)]
pub struct ErrorFabric {
    errors: RwLock<Vec<ErrorString>>,
    threads: RwLock<Vec<Option<Arc<ErrorThread>>>>,
    /// Shard 0, target of foreign-thread counts
    foreign: Arc<ErrorThread>,
    event_log: bool,
}

impl Default for ErrorFabric {
    fn default() -> Self {
        Self::new(false, 1)
    }
}

impl ErrorFabric {
    /// Create fabric with `n_threads` shards allocated up front
    pub fn new(event_log: bool, n_threads: usize) -> Self {
        let foreign = Arc::new(ErrorThread::default());
        let fabric = Self {
            errors: RwLock::new(Vec::new()),
            threads: RwLock::new(vec![Some(foreign.clone())]),
            foreign,
            event_log,
        };
        for id in 1..n_threads {
            fabric.thread(id);
        }
        fabric
    }

    /// Register an error string for a node
    pub fn new_error(&self, node: &str, text: &str) -> ErrorRef {
        let mut errors = self.errors.write();
        let e = ErrorRef(errors.len() as u32);
        if e.index() >= MAX_ERRORS {
            tracing::warn!(node, error = text, "error table full, counts will be dropped");
        }
        errors.push(ErrorString {
            node: node.to_string(),
            text: text.to_string(),
        });
        e
    }

    /// Number of registered errors
    pub fn len(&self) -> usize {
        self.errors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (node, error string) for `e`
    pub fn describe(&self, e: ErrorRef) -> Option<(String, String)> {
        self.errors
            .read()
            .get(e.index())
            .map(|s| (s.node.clone(), s.text.clone()))
    }

    /// Shard for thread `id`. Callers on the dispatch path look this up
    /// once and keep it.
    pub fn thread(&self, id: usize) -> Arc<ErrorThread> {
        if let Some(Some(t)) = self.threads.read().get(id) {
            return t.clone();
        }
        let mut threads = self.threads.write();
        if threads.len() <= id {
            threads.resize(id + 1, None);
        }
        threads[id]
            .get_or_insert_with(|| Arc::new(ErrorThread::default()))
            .clone()
    }

    #[inline]
    fn count(&self, ts: &ErrorThread, e: ErrorRef, n: u64) {
        if n == 0 || !e.is_valid() {
            return;
        }
        let counter = match ts.counter(e.index()) {
            Some(c) => c,
            None => match self.grow(ts, e) {
                Some(c) => c,
                None => {
                    tracing::warn!(error = %e, count = n, "count for unregistered error ref dropped");
                    return;
                }
            },
        };
        counter.fetch_add(n, Ordering::Relaxed);

        if self.event_log && tracing::enabled!(target: "vnet::elog", Level::TRACE) {
            if let Some(s) = self.errors.read().get(e.index()) {
                tracing::trace!(target: "vnet::elog", node = %s.node, error = %s.text, count = n);
            }
        }
    }

    #[cold]
    fn grow<'t>(&self, ts: &'t ErrorThread, e: ErrorRef) -> Option<&'t AtomicU64> {
        if e.index() >= self.len() {
            return None;
        }
        ts.grow(e.index())
    }

    /// Count every reference of a batch against the error ref in its aux
    /// word. Must only be called by the thread that owns `thread_id`.
    pub fn count_refs(&self, thread_id: usize, refs: &[Ref]) {
        let ts = self.thread(thread_id);
        self.count_thread_refs(&ts, refs);
    }

    /// [`count_refs`](Self::count_refs) into a shard the caller already
    /// holds
    pub fn count_thread_refs(&self, ts: &ErrorThread, refs: &[Ref]) {
        let mut cache = ErrorRef(ts.cache.load(Ordering::Relaxed));
        let mut cache_count = 0u64;
        let mut quads = refs.chunks_exact(4);
        for q in &mut quads {
            let e0 = ErrorRef::from_aux(q[0].aux());
            let e1 = ErrorRef::from_aux(q[1].aux());
            let e2 = ErrorRef::from_aux(q[2].aux());
            let e3 = ErrorRef::from_aux(q[3].aux());
            if e0 == cache && e1 == cache && e2 == cache && e3 == cache {
                cache_count += 4;
                continue;
            }
            self.count(ts, e0, 1);
            self.count(ts, e1, 1);
            self.count(ts, e2, 1);
            self.count(ts, e3, 1);
            if e0 == e1 && e2 == e3 && e0 == e2 {
                self.count(ts, cache, cache_count);
                cache = e0;
                cache_count = 0;
            }
        }
        for r in quads.remainder() {
            self.count(ts, ErrorRef::from_aux(r.aux()), 1);
        }

        self.count(ts, cache, cache_count);
        ts.cache.store(cache.0, Ordering::Relaxed);
    }

    /// Count from any thread. Lands in shard 0 with an atomic add; no
    /// ordering is promised against other threads' batched counts.
    pub fn count_atomic(&self, e: ErrorRef, n: u64) {
        self.count(&self.foreign, e, n);
    }

    /// Count since last clear, summed over threads
    pub fn since_clear(&self, e: ErrorRef) -> u64 {
        self.threads
            .read()
            .iter()
            .flatten()
            .map(|t| t.since_clear(e.index()))
            .sum()
    }

    /// Snapshot all counters as the new zero point
    pub fn clear(&self) {
        let n = self.len();
        for t in self.threads.read().iter().flatten() {
            t.clear(n);
        }
    }

    /// Non-zero counts since last clear, sorted by node then error
    pub fn show(&self) -> ErrorReport {
        let errors = self.errors.read().clone();
        let mut rows: Vec<ErrorCount> = errors
            .into_iter()
            .enumerate()
            .filter_map(|(i, s)| {
                let count = self.since_clear(ErrorRef(i as u32));
                (count > 0).then_some(ErrorCount {
                    node: s.node,
                    error: s.text,
                    count,
                })
            })
            .collect();
        rows.sort_by(|a, b| a.node.cmp(&b.node).then_with(|| a.error.cmp(&b.error)));
        ErrorReport(rows)
    }
}

/// One row of an error report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCount {
    pub node: String,
    pub error: String,
    pub count: u64,
}

/// Error counts since last clear
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorReport(pub Vec<ErrorCount>);

impl ErrorReport {
    /// Count for (node, error), zero if absent
    pub fn get(&self, node: &str, error: &str) -> u64 {
        self.0
            .iter()
            .find(|c| c.node == node && c.error == error)
            .map_or(0, |c| c.count)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return writeln!(f, "No errors since last clear.");
        }
        writeln!(f, "{:<30} {:<30} {:>16}", "Node", "Error", "Count")?;
        for c in &self.0 {
            writeln!(f, "{:<30} {:<30} {:>16}", c.node, c.error, c.count)?;
        }
        Ok(())
    }
}

/// Terminal `drop` node: counts each reference against the error ref in
/// its aux word, then frees it
#[derive(Debug, Default)]
pub struct ErrorDropNode;

impl OutputNode for ErrorDropNode {
    fn node_output(&mut self, cx: &NodeContext<'_>, input: &mut RefIn) -> VnetResult<()> {
        cx.pool().free_refs(input.refs.as_slice())?;
        cx.count_refs(input.refs.as_slice());
        input.refs.clear();
        Ok(())
    }
}
