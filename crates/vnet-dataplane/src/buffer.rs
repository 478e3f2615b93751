//! Buffer References and Pool
//!
//! A [`Ref`] is a handle to one buffer fragment. It never owns memory; the
//! [`BufferPool`] does, and also holds the per-buffer "next fragment" link
//! used to chain several fragments into one packet.
//!
//! # Design
//!
//! - `Ref` is `Copy` and 20 bytes; batches move refs, never payload
//! - Chains are singly linked through the pool, head ref carries the
//!   next-valid flag
//! - `Aux` is opaque: an [`ErrorRef`](crate::ErrorRef) on drop paths, an
//!   interface tag elsewhere

use crate::{ErrorRef, VnetError, VnetResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Buffer size including headroom
pub const BUFFER_SIZE: u32 = 2048;

/// Headroom reserved in front of received data for encapsulation
pub const DEFAULT_HEADROOM: u32 = 128;

const REF_NEXT_VALID: u32 = 1 << 0;

/// Buffer fragment reference
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Ref {
    buffer: u32,
    offset: u32,
    len: u32,
    flags: u32,
    aux: u32,
}

impl Ref {
    /// Reference `len` bytes at `offset` of buffer `buffer`
    #[inline(always)]
    pub const fn new(buffer: u32, offset: u32, len: u32) -> Self {
        Self {
            buffer,
            offset,
            len,
            flags: 0,
            aux: 0,
        }
    }

    /// Buffer index in the owning pool
    #[inline(always)]
    pub fn buffer(&self) -> u32 {
        self.buffer
    }

    /// Data start within the buffer
    #[inline(always)]
    pub fn data_offset(&self) -> u32 {
        self.offset
    }

    /// Data length of this fragment
    #[inline(always)]
    pub fn data_len(&self) -> u32 {
        self.len
    }

    #[inline(always)]
    pub fn set_data_len(&mut self, len: u32) {
        self.len = len;
    }

    /// Move the data start by `n` bytes; length shrinks by the same amount.
    /// Negative `n` undoes a previous advance.
    #[inline(always)]
    pub fn advance(&mut self, n: i32) {
        self.offset = (i64::from(self.offset) + i64::from(n)).max(0) as u32;
        self.len = (i64::from(self.len) - i64::from(n)).max(0) as u32;
    }

    /// Another fragment of the same packet follows this one
    #[inline(always)]
    pub fn next_valid(&self) -> bool {
        self.flags & REF_NEXT_VALID != 0
    }

    #[inline(always)]
    pub fn set_next_valid(&mut self, valid: bool) {
        if valid {
            self.flags |= REF_NEXT_VALID;
        } else {
            self.flags &= !REF_NEXT_VALID;
        }
    }

    /// Opaque per-packet word: error code or interface tag
    #[inline(always)]
    pub fn aux(&self) -> u32 {
        self.aux
    }

    #[inline(always)]
    pub fn set_aux(&mut self, aux: u32) {
        self.aux = aux;
    }

    /// Tag this packet with an error for the drop node
    #[inline(always)]
    pub fn set_error(&mut self, e: ErrorRef) {
        self.aux = e.index() as u32;
    }
}

/// In-progress multi-fragment packet
#[derive(Debug, Default)]
pub struct RefChain {
    frags: Vec<Ref>,
    bytes: u64,
}

impl RefChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one fragment to the tail
    #[inline]
    pub fn append(&mut self, r: Ref) {
        self.bytes += u64::from(r.data_len());
        self.frags.push(r);
    }

    /// Number of fragments so far
    pub fn len(&self) -> usize {
        self.frags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frags.is_empty()
    }

    /// Bytes accumulated across fragments
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// First fragment, which becomes the packet reference
    pub fn head_mut(&mut self) -> Option<&mut Ref> {
        self.frags.first_mut()
    }

    /// Link the fragments through `pool` and return the packet head.
    /// The chain is empty afterwards, also on error.
    pub fn done(&mut self, pool: &BufferPool) -> VnetResult<Option<Ref>> {
        let n = self.frags.len();
        if n == 0 {
            return Ok(None);
        }
        let linked = (0..n - 1).rev().try_for_each(|i| {
            // Tail first so every stored link already carries its own flag.
            self.frags[i].set_next_valid(true);
            pool.set_next(&self.frags[i], self.frags[i + 1])
        });
        let head = self.frags[0];
        self.frags.clear();
        self.bytes = 0;
        linked.map(|()| Some(head))
    }
}

/// Buffer pool
///
/// Owns buffer indices and the fragment links between them. Payload memory
/// belongs to whatever device or arena the indices name.
pub struct BufferPool {
    name: String,
    size: usize,
    /// Free buffer indices (stack)
    free_list: Mutex<Vec<u32>>,
    /// Next fragment of each buffer
    links: Mutex<Vec<Option<Ref>>>,
    allocated: AtomicUsize,
}

impl BufferPool {
    /// Create pool of `size` buffers
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
            free_list: Mutex::new((0..size as u32).rev().collect()),
            links: Mutex::new(vec![None; size]),
            allocated: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Allocate one buffer
    #[inline]
    pub fn alloc(&self) -> Option<Ref> {
        let index = self.free_list.lock().pop()?;
        self.links.lock()[index as usize] = None;
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Some(Ref::new(index, DEFAULT_HEADROOM, 0))
    }

    /// Fill every slot of `refs` with a fresh buffer, or none at all
    pub fn alloc_refs(&self, refs: &mut [Ref]) -> VnetResult<()> {
        self.alloc_refs_stride(refs, 0, refs.len(), 1)
    }

    /// Fill `count` slots of `refs` starting at `start`, `stride` apart
    pub fn alloc_refs_stride(
        &self,
        refs: &mut [Ref],
        start: usize,
        count: usize,
        stride: usize,
    ) -> VnetResult<()> {
        if count == 0 {
            return Ok(());
        }
        let last = start + (count - 1) * stride;
        if last >= refs.len() {
            return Err(VnetError::RingOverflow {
                index: last,
                len: refs.len(),
            });
        }

        let mut indices = {
            let mut free = self.free_list.lock();
            if free.len() < count {
                return Err(VnetError::PoolExhausted(self.name.clone()));
            }
            let at = free.len() - count;
            free.split_off(at)
        };
        {
            let mut links = self.links.lock();
            for &i in &indices {
                links[i as usize] = None;
            }
        }
        for k in 0..count {
            if let Some(index) = indices.pop() {
                refs[start + k * stride] = Ref::new(index, DEFAULT_HEADROOM, 0);
            }
        }
        self.allocated.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    fn bad_buffer(&self, r: &Ref) -> VnetError {
        VnetError::BadBuffer {
            buffer: r.buffer,
            pool: self.name.clone(),
        }
    }

    /// Fail unless the pool owns the buffer `r` names
    #[inline]
    pub fn check(&self, r: &Ref) -> VnetResult<()> {
        if (r.buffer as usize) < self.size {
            Ok(())
        } else {
            Err(self.bad_buffer(r))
        }
    }

    /// Return a packet (every fragment of its chain) to the pool. Nothing
    /// is freed if the head names a foreign buffer.
    pub fn free(&self, r: &Ref) -> VnetResult<()> {
        self.check(r)?;
        let mut chain = Vec::with_capacity(1);
        {
            let mut links = self.links.lock();
            let mut cur = Some(*r);
            while let Some(c) = cur {
                // Links are checked on insert; a short walk still ends
                // a corrupted chain.
                let Some(slot) = links.get_mut(c.buffer as usize) else {
                    break;
                };
                chain.push(c.buffer);
                let next = slot.take();
                cur = if c.next_valid() && chain.len() < self.size {
                    next
                } else {
                    None
                };
            }
        }
        self.release(&chain);
        Ok(())
    }

    /// Return several packets to the pool. Every head is checked first, so
    /// a batch is either freed whole or not at all.
    pub fn free_refs(&self, refs: &[Ref]) -> VnetResult<()> {
        refs.iter().try_for_each(|r| self.check(r))?;
        for r in refs {
            self.free(r)?;
        }
        Ok(())
    }

    /// Return individual buffers without walking chains; used where
    /// every fragment already appears in `refs`
    pub fn free_buffers(&self, refs: &[Ref]) -> VnetResult<()> {
        refs.iter().try_for_each(|r| self.check(r))?;
        {
            let mut links = self.links.lock();
            for r in refs {
                if let Some(slot) = links.get_mut(r.buffer as usize) {
                    *slot = None;
                }
            }
        }
        let indices: Vec<u32> = refs.iter().map(|r| r.buffer).collect();
        self.release(&indices);
        Ok(())
    }

    fn release(&self, indices: &[u32]) {
        let mut free = self.free_list.lock();
        for &i in indices {
            if free.len() < self.size {
                free.push(i);
            }
        }
        self.allocated.fetch_sub(indices.len().min(self.allocated()), Ordering::Relaxed);
    }

    /// Link `next` as the fragment following `prev`
    pub fn set_next(&self, prev: &Ref, next: Ref) -> VnetResult<()> {
        self.check(&next)?;
        let mut links = self.links.lock();
        let slot = links
            .get_mut(prev.buffer as usize)
            .ok_or_else(|| self.bad_buffer(prev))?;
        *slot = Some(next);
        Ok(())
    }

    /// Fragment following `r`, if `r` says there is one
    #[inline]
    pub fn next_ref(&self, r: &Ref) -> VnetResult<Option<Ref>> {
        if !r.next_valid() {
            return Ok(None);
        }
        self.links
            .lock()
            .get(r.buffer as usize)
            .copied()
            .ok_or_else(|| self.bad_buffer(r))
    }

    /// All fragments of the packet headed by `head`, in order
    pub fn chain(&self, head: &Ref) -> VnetResult<Vec<Ref>> {
        self.check(head)?;
        let mut frags = vec![*head];
        let mut cur = *head;
        while let Some(next) = self.next_ref(&cur)? {
            if frags.len() >= self.size {
                return Err(self.bad_buffer(&next));
            }
            frags.push(next);
            cur = next;
        }
        Ok(frags)
    }

    /// Total bytes of the packet headed by `head`
    pub fn packet_len(&self, head: &Ref) -> VnetResult<u64> {
        Ok(self.chain(head)?.iter().map(|r| u64::from(r.data_len())).sum())
    }

    /// Get available count
    pub fn available(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Get allocated count
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Get pool size
    pub fn size(&self) -> usize {
        self.size
    }
}
