//! Receive DMA Ring
//!
//! Turns hardware descriptor completions into packet references.
//!
//! # Design
//!
//! - The ring holds `2 * ring_len` refs. For an even sequence, even slots
//!   receive and odd slots refill the hardware; odd sequences swap roles.
//!   On wrap the stale half gets fresh buffers.
//! - Single-fragment packets whose descriptor flags match the cached flags
//!   are written speculatively into the cached next at the cached count,
//!   with the cached advance and aux applied.
//! - Anything else takes the slow path: fragments accumulate in a chain
//!   and the driver's [`RxDmaRinger::get_ref_state`] decides next, advance
//!   and aux once end of packet is seen.
//! - The cached next only moves after 4 consecutive slow-path packets
//!   agree on the same new next. Cached flags, advance and aux always
//!   describe the cached next.

use crate::buffer::{BufferPool, Ref, RefChain};
use crate::stats::{InterfaceCounters, RxTx};
use crate::vector::{RefOut, RefVec};
use crate::{VnetError, VnetResult};
use std::sync::Arc;

/// Slow-path packets to the same new next before the cache switches
const MISS_SWITCH: usize = 4;

/// Where a received packet goes and how to fix it up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxDmaRefState {
    /// Next index
    pub next: usize,
    /// Bytes to advance the packet's data start
    pub advance: i32,
    /// Interface / error tag
    pub aux: u32,
}

/// Hardware-specific half of a receive ring
pub trait RxDmaRinger: Send {
    /// Decode completed descriptor flags
    fn get_ref_state(&self, flags: u64) -> RxDmaRefState;
}

/// Slot in the double-length ref vector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxDmaRingIndex(usize);

impl RxDmaRingIndex {
    /// Index `n` descriptors further on
    #[inline(always)]
    pub fn next(self, n: usize) -> Self {
        RxDmaRingIndex(self.0 + 2 * n)
    }

    /// Descriptor index within the hardware ring
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 / 2
    }
}

/// Counters published by [`RxDmaRing::flush`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxFlushStats {
    pub packets: u64,
    pub bytes: u64,
}

/// Receive ring of one hardware queue
pub struct RxDmaRing<D> {
    driver: D,
    pool: Arc<BufferPool>,
    counters: Option<Arc<InterfaceCounters>>,
    ring_len: usize,
    sequence: usize,
    refs: RefVec,

    chain: RefChain,
    is_sop: bool,
    last_miss_next: usize,
    n_last_miss_next: usize,

    desc_flags: u64,
    eop_shift: u32,
    ref_state: RxDmaRefState,

    /// Cached next and its uncommitted count
    next: usize,
    n_next: usize,
    max_n_next: usize,
    n_packets: u64,
    n_bytes: u64,
}

impl<D: RxDmaRinger> RxDmaRing<D> {
    /// Create a ring of `ring_len` descriptors and fill both halves.
    /// `flags` seeds the cached descriptor flags; bit `eop_shift` of a
    /// flags word marks end of packet.
    pub fn new(
        driver: D,
        pool: Arc<BufferPool>,
        ring_len: usize,
        flags: u64,
        eop_shift: u32,
    ) -> VnetResult<Self> {
        let ref_state = driver.get_ref_state(flags);
        let mut refs = RefVec::with_capacity(2 * ring_len);
        refs.set_len(2 * ring_len);
        pool.alloc_refs(refs.as_mut_slice())?;
        Ok(Self {
            driver,
            pool,
            counters: None,
            ring_len,
            sequence: 0,
            refs,
            chain: RefChain::new(),
            is_sop: true,
            last_miss_next: 0,
            n_last_miss_next: 0,
            desc_flags: flags,
            eop_shift,
            ref_state,
            next: ref_state.next,
            n_next: 0,
            max_n_next: 0,
            n_packets: 0,
            n_bytes: 0,
        })
    }

    /// Publish flushed counters to an interface
    pub fn with_counters(mut self, counters: Arc<InterfaceCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn ring_len(&self) -> usize {
        self.ring_len
    }

    /// Currently cached next index
    pub fn cached_next(&self) -> usize {
        self.next
    }

    /// Ring slot of descriptor `i` for the current sequence
    #[inline(always)]
    pub fn ring_index(&self, i: usize) -> RxDmaRingIndex {
        RxDmaRingIndex(2 * i + (self.sequence & 1))
    }

    fn slot(&self, i: usize) -> VnetResult<Ref> {
        self.refs
            .as_slice()
            .get(i)
            .copied()
            .ok_or(VnetError::RingOverflow {
                index: i,
                len: self.refs.len(),
            })
    }

    /// Buffer the hardware received into at `ri`
    pub fn rx_ref(&self, ri: RxDmaRingIndex) -> VnetResult<Ref> {
        self.slot(ri.0)
    }

    /// Buffer to hand back to the hardware at `ri`
    pub fn refill_ref(&self, ri: RxDmaRingIndex) -> VnetResult<Ref> {
        self.slot(ri.0 ^ 1)
    }

    /// Ring wrapped: give the half just received into fresh buffers. The
    /// parity only flips once that half is refilled.
    pub fn wrap_refill(&mut self) -> VnetResult<()> {
        let ri0 = self.sequence & 1;
        self.pool
            .alloc_refs_stride(self.refs.as_mut_slice(), ri0, self.ring_len, 2)?;
        self.sequence += 1;
        Ok(())
    }

    #[inline(always)]
    fn is_end_of_packet(&self, f: u64) -> bool {
        (f >> self.eop_shift) & 1 != 0
    }

    #[inline(always)]
    fn fast_ref(&self, mut r: Ref) -> Ref {
        r.advance(self.ref_state.advance);
        r.set_aux(self.ref_state.aux);
        r
    }

    #[inline]
    fn begin(&mut self, out: &mut RefOut) {
        out.validate_next(self.next);
        if self.n_next == 0 {
            self.n_next = out.outs[self.next].len();
        }
    }

    /// Process one completed descriptor of `b0` bytes
    pub fn rx1_descriptor(
        &mut self,
        out: &mut RefOut,
        ri: RxDmaRingIndex,
        b0: u32,
        f0: u64,
    ) -> VnetResult<()> {
        let mut r0 = self.rx_ref(ri)?;
        r0.set_data_len(b0);
        self.begin(out);

        let was_sop = self.is_sop;
        self.n_packets += u64::from(was_sop);
        self.n_bytes += u64::from(b0);
        self.is_sop = self.is_end_of_packet(f0);

        if was_sop && self.is_sop && f0 == self.desc_flags {
            out.outs[self.next].put(self.n_next, self.fast_ref(r0));
            self.n_next += 1;
            return Ok(());
        }

        self.slow_path(out, r0, f0)
    }

    /// Process four consecutive completed descriptors
    pub fn rx4_descriptors(
        &mut self,
        out: &mut RefOut,
        ri: RxDmaRingIndex,
        b: [u32; 4],
        f: [u64; 4],
    ) -> VnetResult<()> {
        let mut r = [
            self.rx_ref(ri)?,
            self.rx_ref(ri.next(1))?,
            self.rx_ref(ri.next(2))?,
            self.rx_ref(ri.next(3))?,
        ];
        for (r, &b) in r.iter_mut().zip(&b) {
            r.set_data_len(b);
        }
        self.begin(out);

        // Speculatively enqueue all four to the cached next.
        let n0 = self.n_next;
        for (k, &rk) in r.iter().enumerate() {
            let fr = self.fast_ref(rk);
            out.outs[self.next].put(n0 + k, fr);
        }

        let eop = f.map(|f| self.is_end_of_packet(f));
        let was_sop = self.is_sop;
        self.n_bytes += b.iter().map(|&b| u64::from(b)).sum::<u64>();
        self.n_packets +=
            u64::from(was_sop) + u64::from(eop[0]) + u64::from(eop[1]) + u64::from(eop[2]);
        self.is_sop = eop[3];

        let d = self.desc_flags;
        if was_sop && self.is_end_of_packet(d) && f.iter().all(|&f| f == d) {
            self.n_next = n0 + 4;
            return Ok(());
        }

        for (rk, fk) in r.into_iter().zip(f) {
            self.slow_path(out, rk, fk)?;
        }
        Ok(())
    }

    fn slow_path(&mut self, out: &mut RefOut, r0: Ref, f0: u64) -> VnetResult<()> {
        self.chain.append(r0);
        if !self.is_end_of_packet(f0) {
            return Ok(());
        }

        let rs0 = self.driver.get_ref_state(f0);
        if let Some(head) = self.chain.head_mut() {
            head.advance(rs0.advance);
            head.set_aux(rs0.aux);
        }
        let Some(packet) = self.chain.done(&self.pool)? else {
            return Ok(());
        };

        let next0 = rs0.next;
        out.validate_next(next0);
        let (mut next, mut n_next) = (self.next, self.n_next);

        // Cache empty?
        if n_next == 0 {
            next = next0;
            n_next = out.outs[next0].len();
        }

        if next0 == next {
            self.n_last_miss_next = 0;
            out.outs[next].put(n_next, packet);
            n_next += 1;
        } else {
            let l0 = out.outs[next0].push(packet);
            self.max_n_next = self.max_n_next.max(l0);

            if next0 == self.last_miss_next {
                self.n_last_miss_next += 1;
                if self.n_last_miss_next >= MISS_SWITCH {
                    if n_next > 0 {
                        out.outs[next].set_len(n_next);
                        self.max_n_next = self.max_n_next.max(n_next);
                    }
                    next = next0;
                    n_next = l0;
                    self.n_last_miss_next = 0;
                }
            } else {
                self.last_miss_next = next0;
                self.n_last_miss_next = 1;
            }
        }

        if next0 == next {
            self.desc_flags = f0;
            self.ref_state = rs0;
        }
        self.next = next;
        self.n_next = n_next;
        Ok(())
    }

    /// Commit the cached run and publish this round's counters. Call once
    /// per round whether or not anything was received.
    pub fn flush(&mut self, out: &mut RefOut) -> RxFlushStats {
        if self.n_next > 0 {
            out.validate_next(self.next);
            let o = &mut out.outs[self.next];
            if self.n_next > o.len() {
                o.set_len(self.n_next);
            }
            self.n_next = 0;
        }

        let stats = RxFlushStats {
            packets: self.n_packets,
            bytes: self.n_bytes,
        };
        if let Some(c) = &self.counters {
            c.record(RxTx::Rx, stats.packets, stats.bytes);
        }
        self.n_packets = 0;
        self.n_bytes = 0;
        self.max_n_next = 0;
        stats
    }

    /// Largest single next batch built this round
    pub fn max_next(&self) -> usize {
        self.n_next.max(self.max_n_next)
    }
}
