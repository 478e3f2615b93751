//! Transmit Pipeline
//!
//! Per-interface output: the dispatch thread packs input references into
//! transmit batches and hands them to a dedicated worker, which calls the
//! hardware driver.
//!
//! # Design
//!
//! - Two bounded queues per interface: batches to the worker, and retired
//!   vectors back to the producer for reuse
//! - A batch never splits a packet; every fragment of a chained packet is
//!   copied into the same batch. A packet too large for any batch is
//!   counted and freed, and the rest of the input still goes out
//! - Outstanding references are counted from send until the driver frees
//!   the batch; the output node reports itself suspended from
//!   `SUSPEND_LIMITS.suspend` until the count drains to
//!   `SUSPEND_LIMITS.resume`
//! - Admin down closes the worker queue; the worker drains what it already
//!   has and exits, returning the driver

use crate::buffer::{BufferPool, Ref};
use crate::config::DataplaneConfig;
use crate::node::{NodeContext, NodeRegistration, OutputNode};
use crate::stats::{InterfaceCounters, RxTx};
use crate::vector::{RefIn, RefVec};
use crate::{VnetError, VnetResult, MAX_OUTSTANDING_TX_REFS, MAX_VECTOR_LEN};
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::Level;

/// Error index: references sent while the interface is down
pub const TX_DOWN_DROPS: usize = 0;
/// Error index: worker queue full
pub const TX_QUEUE_FULL_DROPS: usize = 1;
/// Error index: packet spans more fragments than one batch holds
pub const TX_PACKET_TOO_LARGE: usize = 2;

const TX_ERRORS: [&str; 3] = ["tx down drops", "tx queue full drops", "tx packet too large"];

/// Retired vectors kept for reuse
const FREE_QUEUE_LEN: usize = 2 * MAX_OUTSTANDING_TX_REFS / MAX_VECTOR_LEN;

/// Suspend / resume thresholds in outstanding references
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuspendLimits {
    pub suspend: usize,
    pub resume: usize,
}

pub const SUSPEND_LIMITS: SuspendLimits = SuspendLimits {
    suspend: MAX_OUTSTANDING_TX_REFS,
    resume: MAX_OUTSTANDING_TX_REFS / 2,
};

#[derive(Debug, Default)]
struct BackpressureState {
    outstanding: usize,
    suspended: bool,
}

/// Outstanding-reference counter with suspend/resume hysteresis
#[derive(Debug)]
pub struct Backpressure {
    limits: SuspendLimits,
    state: Mutex<BackpressureState>,
}

impl Backpressure {
    pub fn new(limits: SuspendLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(BackpressureState::default()),
        }
    }

    /// Add `delta` outstanding references; returns whether the producer
    /// is now suspended
    pub fn add_activity(&self, delta: isize) -> bool {
        let mut s = self.state.lock();
        s.outstanding = s.outstanding.saturating_add_signed(delta);
        if !s.suspended && s.outstanding >= self.limits.suspend {
            s.suspended = true;
            tracing::debug!(outstanding = s.outstanding, "tx suspended");
        } else if s.suspended && s.outstanding <= self.limits.resume {
            s.suspended = false;
            tracing::debug!(outstanding = s.outstanding, "tx resumed");
        }
        s.suspended
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    pub fn limits(&self) -> SuspendLimits {
        self.limits
    }
}

/// State shared by an interface and every batch in flight
struct TxShared {
    name: String,
    backpressure: Backpressure,
    free_tx: Sender<RefVec>,
    pool: Arc<BufferPool>,
}

/// Outbound batch handed to the driver. Dropping it without calling
/// [`free`](TxRefVecIn::free) leaks its buffers and backpressure credit.
pub struct TxRefVecIn {
    refs: RefVec,
    n_packets: usize,
    thread_id: usize,
    owner: Arc<TxShared>,
}

impl TxRefVecIn {
    /// Every fragment of every packet, in order
    pub fn refs(&self) -> &[Ref] {
        self.refs.as_slice()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn n_packets(&self) -> usize {
        self.n_packets
    }

    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    /// Transmission done: return buffers to the pool and release
    /// backpressure credit
    pub fn free(mut self) {
        let owner = self.owner;
        owner.backpressure.add_activity(-(self.refs.len() as isize));
        if let Err(e) = owner.pool.free_buffers(self.refs.as_slice()) {
            tracing::warn!(interface = %owner.name, error = %e, "tx batch buffers not freed");
        }
        self.refs.clear();
        let _ = owner.free_tx.try_send(self.refs);
    }
}

impl std::fmt::Debug for TxRefVecIn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxRefVecIn")
            .field("interface", &self.owner.name)
            .field("refs", &self.refs.len())
            .field("n_packets", &self.n_packets)
            .finish()
    }
}

/// Hardware-specific transmit
pub trait TxDriver: Send + 'static {
    /// Transmit a batch; the driver frees it once the hardware is done
    fn interface_output(&mut self, batch: TxRefVecIn);
}

#[derive(Default)]
struct TxState {
    tx: Option<Sender<TxRefVecIn>>,
    worker: Option<JoinHandle<Box<dyn TxDriver>>>,
}

/// Transmit side of one interface
pub struct TxInterface {
    shared: Arc<TxShared>,
    free_rx: Receiver<RefVec>,
    state: Mutex<TxState>,
    counters: Arc<InterfaceCounters>,
    max_vector_len: usize,
    event_log: bool,
}

impl TxInterface {
    pub fn new(name: impl Into<String>, pool: Arc<BufferPool>, config: &DataplaneConfig) -> Self {
        Self::with_limits(name, pool, config, SUSPEND_LIMITS)
    }

    pub fn with_limits(
        name: impl Into<String>,
        pool: Arc<BufferPool>,
        config: &DataplaneConfig,
        limits: SuspendLimits,
    ) -> Self {
        let name = name.into();
        let (free_tx, free_rx) = bounded(FREE_QUEUE_LEN);
        Self {
            counters: Arc::new(InterfaceCounters::new(name.clone())),
            shared: Arc::new(TxShared {
                name,
                backpressure: Backpressure::new(limits),
                free_tx,
                pool,
            }),
            free_rx,
            state: Mutex::new(TxState::default()),
            max_vector_len: config.tx_vector_len.clamp(1, MAX_VECTOR_LEN),
            event_log: config.event_log,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn counters(&self) -> &Arc<InterfaceCounters> {
        &self.counters
    }

    pub fn backpressure(&self) -> &Backpressure {
        &self.shared.backpressure
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.backpressure.is_suspended()
    }

    pub fn is_up(&self) -> bool {
        self.state.lock().tx.is_some()
    }

    /// Output node for this interface, named after it
    pub fn registration(self: &Arc<Self>) -> NodeRegistration {
        NodeRegistration::output(
            self.name().to_string(),
            InterfaceOutputNode {
                iface: self.clone(),
            },
        )
        .errors(TX_ERRORS)
    }

    /// Start the worker thread driving `driver`
    pub fn admin_up(&self, mut driver: Box<dyn TxDriver>) -> VnetResult<()> {
        let mut state = self.state.lock();
        if state.tx.is_some() {
            return Err(VnetError::AlreadyUp(self.name().to_string()));
        }

        let (tx, rx) = bounded::<TxRefVecIn>(MAX_OUTSTANDING_TX_REFS);
        let name = self.name().to_string();
        let event_log = self.event_log;
        let handle = thread::Builder::new()
            .name(format!("vnet-tx-{}", name))
            .spawn(move || {
                for batch in rx.iter() {
                    if event_log && tracing::enabled!(target: "vnet::elog", Level::TRACE) {
                        tracing::trace!(target: "vnet::elog", kind = "tx", node = %name, n_refs = batch.len());
                    }
                    driver.interface_output(batch);
                }
                driver
            })
            .map_err(|e| VnetError::SpawnFailed(e.to_string()))?;

        state.tx = Some(tx);
        state.worker = Some(handle);
        tracing::info!(interface = %self.name(), "interface up");
        Ok(())
    }

    /// Close the worker queue and wait for the worker to drain. Returns
    /// the driver unless the worker panicked.
    pub fn admin_down(&self) -> Option<Box<dyn TxDriver>> {
        let worker = {
            let mut state = self.state.lock();
            state.tx = None;
            state.worker.take()
        };
        let handle = worker?;
        tracing::info!(interface = %self.name(), "interface down");
        match handle.join() {
            Ok(driver) => Some(driver),
            Err(_) => {
                tracing::warn!(interface = %self.name(), "tx worker panicked");
                None
            }
        }
    }

    fn alloc_vec(&self) -> RefVec {
        match self.free_rx.try_recv() {
            Ok(mut v) => {
                v.clear();
                v
            }
            Err(_) => RefVec::with_capacity(self.max_vector_len),
        }
    }

    fn recycle(&self, mut v: RefVec) {
        v.clear();
        let _ = self.shared.free_tx.try_send(v);
    }

    /// Pack `input` into transmit batches and send them to the worker
    pub fn if_output(&self, cx: &NodeContext<'_>, input: &RefIn) -> VnetResult<()> {
        let n_in = input.len();
        if n_in == 0 {
            return Ok(());
        }
        let tx = self.state.lock().tx.clone();
        let Some(tx) = tx else {
            cx.count_error(TX_DOWN_DROPS, n_in as u64);
            return self.shared.pool.free_refs(input.refs.as_slice());
        };

        let mut b = TxBuilder {
            iface: self,
            cx,
            tx: &tx,
            thread_id: input.thread_id(),
            rv: self.alloc_vec(),
            n_packets: 0,
            n_bytes: 0,
            n_dropped: 0,
        };
        let max = self.max_vector_len;
        let pool = &self.shared.pool;
        let rs = input.refs.as_slice();

        let mut quads = rs.chunks_exact(4);
        for q in &mut quads {
            if b.rv.len() + 4 <= max && q.iter().all(|r| !r.next_valid() && pool.check(r).is_ok()) {
                b.rv.extend_from_slice(q);
                b.n_packets += 4;
                b.n_bytes += q.iter().map(|r| u64::from(r.data_len())).sum::<u64>();
                continue;
            }
            for r in q {
                b.slow_path(r)?;
            }
        }
        for r in quads.remainder() {
            if b.rv.len() < max && !r.next_valid() && pool.check(r).is_ok() {
                b.rv.push(*r);
                b.n_packets += 1;
                b.n_bytes += u64::from(r.data_len());
                continue;
            }
            b.slow_path(r)?;
        }

        if b.n_dropped > 0 {
            cx.count_error(TX_PACKET_TOO_LARGE, b.n_dropped);
        }
        self.counters.record(RxTx::Tx, n_in as u64 - b.n_dropped, b.n_bytes);
        b.finish();
        Ok(())
    }

    fn send(&self, cx: &NodeContext<'_>, tx: &Sender<TxRefVecIn>, batch: TxRefVecIn) {
        let l = batch.len();
        if self.event_log && tracing::enabled!(target: "vnet::elog", Level::TRACE) {
            tracing::trace!(target: "vnet::elog", kind = "send-tx", node = %self.name(), n_refs = l);
        }
        self.shared.backpressure.add_activity(l as isize);

        match tx.try_send(batch) {
            Ok(()) => {}
            Err(TrySendError::Full(batch)) => {
                cx.count_error(TX_QUEUE_FULL_DROPS, batch.n_packets() as u64);
                batch.free();
            }
            Err(TrySendError::Disconnected(batch)) => {
                cx.count_error(TX_DOWN_DROPS, batch.n_packets() as u64);
                batch.free();
            }
        }
    }
}

/// One `if_output` call's batch in progress
struct TxBuilder<'a> {
    iface: &'a TxInterface,
    cx: &'a NodeContext<'a>,
    tx: &'a Sender<TxRefVecIn>,
    thread_id: usize,
    rv: RefVec,
    n_packets: usize,
    n_bytes: u64,
    /// Packets too large for any batch
    n_dropped: u64,
}

impl TxBuilder<'_> {
    /// Copy a whole packet, flushing first if it would not fit
    fn slow_path(&mut self, head: &Ref) -> VnetResult<()> {
        let iface = self.iface;
        let max = iface.max_vector_len;
        let pool = &iface.shared.pool;
        let frags = match pool.chain(head) {
            Ok(frags) => frags,
            Err(e) => {
                self.flush();
                return Err(e);
            }
        };
        if frags.len() > max {
            tracing::debug!(
                interface = %iface.name(),
                fragments = frags.len(),
                max,
                "tx packet too large, dropped"
            );
            self.n_dropped += 1;
            return pool.free(head);
        }
        if self.rv.len() + frags.len() > max {
            self.flush();
        }
        self.rv.extend_from_slice(&frags);
        self.n_packets += 1;
        self.n_bytes += frags.iter().map(|r| u64::from(r.data_len())).sum::<u64>();
        if self.rv.len() == max {
            self.flush();
        }
        Ok(())
    }

    fn flush(&mut self) {
        if self.rv.is_empty() {
            return;
        }
        let rv = std::mem::replace(&mut self.rv, self.iface.alloc_vec());
        let batch = TxRefVecIn {
            refs: rv,
            n_packets: std::mem::take(&mut self.n_packets),
            thread_id: self.thread_id,
            owner: self.iface.shared.clone(),
        };
        self.iface.send(self.cx, self.tx, batch);
    }

    fn finish(mut self) {
        self.flush();
        self.iface.recycle(self.rv);
    }
}

/// Graph output node feeding a [`TxInterface`]
pub struct InterfaceOutputNode {
    iface: Arc<TxInterface>,
}

impl InterfaceOutputNode {
    pub fn interface(&self) -> &Arc<TxInterface> {
        &self.iface
    }
}

impl OutputNode for InterfaceOutputNode {
    fn node_output(&mut self, cx: &NodeContext<'_>, input: &mut RefIn) -> VnetResult<()> {
        self.iface.if_output(cx, input)
    }

    fn is_suspended(&self) -> bool {
        self.iface.is_suspended()
    }
}

/// Batches handed to hardware, retired as completions arrive
pub struct TxDmaRing {
    to_interrupt_tx: Sender<TxRefVecIn>,
    to_interrupt: Receiver<TxRefVecIn>,
    current: Option<TxRefVecIn>,
    /// References of `current` not yet completed
    n: usize,
}

impl Default for TxDmaRing {
    fn default() -> Self {
        Self::new()
    }
}

impl TxDmaRing {
    pub fn new() -> Self {
        let (to_interrupt_tx, to_interrupt) = bounded(MAX_OUTSTANDING_TX_REFS);
        Self {
            to_interrupt_tx,
            to_interrupt,
            current: None,
            n: 0,
        }
    }

    /// Handle for the driver to queue batches it has given the hardware
    pub fn sender(&self) -> Sender<TxRefVecIn> {
        self.to_interrupt_tx.clone()
    }

    /// Queue a batch given to the hardware
    pub fn push(&self, batch: TxRefVecIn) -> VnetResult<()> {
        self.to_interrupt_tx
            .send(batch)
            .map_err(|_| VnetError::QueueClosed)
    }

    /// Hardware completed `n` more references. Batches fully completed are
    /// freed. Returns how many references were retired; fewer than `n`
    /// only when nothing more is queued.
    pub fn interrupt_advance(&mut self, mut n: usize) -> usize {
        let mut advanced = 0;
        while n > 0 {
            if self.current.is_none() {
                match self.to_interrupt.try_recv() {
                    Ok(batch) => {
                        self.n = batch.len();
                        self.current = Some(batch);
                    }
                    Err(_) => break,
                }
            }

            if n < self.n {
                self.n -= n;
                advanced += n;
                break;
            }

            n -= self.n;
            advanced += self.n;
            self.n = 0;
            if let Some(batch) = self.current.take() {
                batch.free();
            }
        }
        advanced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::node::NodeIndex;
    use crate::vector::RefIn;

    /// Records buffer indices, then frees or queues each batch
    struct RecordingDriver {
        seen: Arc<Mutex<Vec<Vec<u32>>>>,
        ring: Option<Sender<TxRefVecIn>>,
    }

    impl TxDriver for RecordingDriver {
        fn interface_output(&mut self, batch: TxRefVecIn) {
            self.seen.lock().push(batch.refs().iter().map(|r| r.buffer()).collect());
            match &self.ring {
                Some(ring) => ring.send(batch).unwrap(),
                None => batch.free(),
            }
        }
    }

    struct Setup {
        pool: Arc<BufferPool>,
        graph: Graph,
        iface: Arc<TxInterface>,
        node: NodeIndex,
    }

    fn setup(tx_vector_len: usize, limits: SuspendLimits) -> Setup {
        let config = DataplaneConfig {
            tx_vector_len,
            ..Default::default()
        };
        let pool = Arc::new(BufferPool::new("tx", 256));
        let iface = Arc::new(TxInterface::with_limits("eth0", pool.clone(), &config, limits));
        let mut graph = Graph::new(config, pool.clone());
        let node = graph.register(iface.registration()).unwrap();
        graph.finalize().unwrap();
        Setup {
            pool,
            graph,
            iface,
            node,
        }
    }

    /// One packet per entry of `frags`, each with that many fragments
    fn packets(pool: &BufferPool, frags: &[usize]) -> (Vec<Ref>, Vec<u32>) {
        let mut heads = Vec::new();
        let mut order = Vec::new();
        for &n in frags {
            let mut chain = crate::buffer::RefChain::new();
            for _ in 0..n {
                let mut r = pool.alloc().unwrap();
                r.set_data_len(100);
                order.push(r.buffer());
                chain.append(r);
            }
            heads.push(chain.done(pool).unwrap().unwrap());
        }
        (heads, order)
    }

    #[test]
    fn test_backpressure_hysteresis() {
        let bp = Backpressure::new(SuspendLimits { suspend: 8, resume: 4 });
        assert!(!bp.add_activity(7));
        assert!(bp.add_activity(1));
        assert!(bp.add_activity(-3));
        assert!(!bp.add_activity(-1));
        assert!(!bp.add_activity(3));
        assert_eq!(bp.outstanding(), 7);
        assert!(bp.add_activity(1));
        assert!(!bp.add_activity(-8));
        assert_eq!(bp.outstanding(), 0);
    }

    #[test]
    fn test_default_limits() {
        assert_eq!(SUSPEND_LIMITS.suspend, 16 * MAX_VECTOR_LEN);
        assert_eq!(SUSPEND_LIMITS.resume, SUSPEND_LIMITS.suspend / 2);
    }

    #[test]
    fn test_tx_down_drops() {
        let mut s = setup(MAX_VECTOR_LEN, SUSPEND_LIMITS);
        let (refs, _) = packets(&s.pool, &[1, 1, 3]);
        let mut input = RefIn::from_refs(0, refs);
        s.graph.node_output(s.node, &mut input).unwrap();

        assert_eq!(s.graph.show_errors().get("eth0", "tx down drops"), 3);
        assert_eq!(s.pool.allocated(), 0);
    }

    #[test]
    fn test_batches_keep_packets_whole() {
        let mut s = setup(4, SUSPEND_LIMITS);
        let seen = Arc::new(Mutex::new(Vec::new()));
        s.iface
            .admin_up(Box::new(RecordingDriver {
                seen: seen.clone(),
                ring: None,
            }))
            .unwrap();
        assert!(matches!(
            s.iface.admin_up(Box::new(RecordingDriver {
                seen: seen.clone(),
                ring: None,
            })),
            Err(VnetError::AlreadyUp(_))
        ));

        let shape = [1, 1, 3, 1, 1, 1, 1, 2, 4, 1];
        let (refs, order) = packets(&s.pool, &shape);
        let mut input = RefIn::from_refs(0, refs);
        s.graph.node_output(s.node, &mut input).unwrap();
        assert!(s.iface.admin_down().is_some());
        assert!(!s.iface.is_up());

        let batches = seen.lock().clone();
        assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= 4));
        assert_eq!(batches.concat(), order);
        // The 4-fragment packet gets a batch of its own.
        assert!(batches.iter().any(|b| b.len() == 4 && b[0] == order[11]));
        assert_eq!(s.pool.allocated(), 0);
        assert_eq!(s.iface.backpressure().outstanding(), 0);

        let snap = s.iface.counters().snapshot();
        assert_eq!(snap.tx_packets, shape.len() as u64);
        assert_eq!(snap.tx_bytes, 100 * shape.iter().sum::<usize>() as u64);
    }

    #[test]
    fn test_packet_too_large() {
        let mut s = setup(4, SUSPEND_LIMITS);
        let seen = Arc::new(Mutex::new(Vec::new()));
        s.iface
            .admin_up(Box::new(RecordingDriver {
                seen: seen.clone(),
                ring: None,
            }))
            .unwrap();
        let (refs, order) = packets(&s.pool, &[5, 1, 1]);
        let mut input = RefIn::from_refs(0, refs);
        assert_eq!(
            s.graph.node_output(s.node, &mut input).unwrap(),
            crate::graph::Dispatch::Done
        );
        assert!(s.iface.admin_down().is_some());

        // The 5-fragment packet is counted and freed; the rest go out.
        assert_eq!(seen.lock().concat(), order[5..].to_vec());
        assert_eq!(s.graph.show_errors().get("eth0", "tx packet too large"), 1);
        assert_eq!(s.pool.allocated(), 0);
        assert_eq!(s.iface.counters().snapshot().tx_packets, 2);
    }

    #[test]
    fn test_tx_foreign_buffer_is_contained() {
        let mut s = setup(4, SUSPEND_LIMITS);
        s.iface
            .admin_up(Box::new(RecordingDriver {
                seen: Arc::default(),
                ring: None,
            }))
            .unwrap();
        let mut input = RefIn::from_refs(0, vec![Ref::new(1000, 0, 64)]);
        assert_eq!(
            s.graph.node_output(s.node, &mut input).unwrap(),
            crate::graph::Dispatch::Dropped { refs: 1 }
        );
        assert!(s.iface.admin_down().is_some());
    }

    #[test]
    fn test_suspend_resume_conservation() {
        let mut s = setup(4, SuspendLimits { suspend: 8, resume: 4 });
        let mut ring = TxDmaRing::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        s.iface
            .admin_up(Box::new(RecordingDriver {
                seen: seen.clone(),
                ring: Some(ring.sender()),
            }))
            .unwrap();

        let (refs, mut order) = packets(&s.pool, &[1; 4]);
        s.graph.node_output(s.node, &mut RefIn::from_refs(0, refs)).unwrap();
        assert!(!s.graph.is_suspended(s.node));

        let (refs, more) = packets(&s.pool, &[1; 4]);
        order.extend(more);
        s.graph.node_output(s.node, &mut RefIn::from_refs(0, refs)).unwrap();
        assert!(s.graph.is_suspended(s.node));

        // Drain the worker so both batches sit in the ring.
        let driver = s.iface.admin_down();
        assert!(driver.is_some());

        assert_eq!(ring.interrupt_advance(3), 3);
        assert!(s.graph.is_suspended(s.node));
        assert_eq!(ring.interrupt_advance(1), 1);
        assert!(!s.graph.is_suspended(s.node));
        assert_eq!(ring.interrupt_advance(10), 4);

        assert_eq!(seen.lock().concat(), order);
        assert_eq!(s.iface.backpressure().outstanding(), 0);
        assert_eq!(s.pool.allocated(), 0);
    }
}
