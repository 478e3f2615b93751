//! Reference Vectors
//!
//! Batches exchanged between nodes. A [`RefVec`] keeps validated storage
//! separate from its committed length so the redirect engine and the
//! receive ring can write speculatively past the end and commit later.

use crate::buffer::Ref;
use std::ops::{Index, IndexMut};

/// Thread id of a batch whose owner has gone away
pub const INVALID_THREAD: usize = usize::MAX;

/// Growable ordered vector of references
#[derive(Debug, Clone, Default)]
pub struct RefVec {
    refs: Vec<Ref>,
    len: usize,
}

impl RefVec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with `n` validated slots and zero length
    pub fn with_capacity(n: usize) -> Self {
        Self {
            refs: vec![Ref::default(); n],
            len: 0,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of validated slots
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.refs.len()
    }

    /// Make slot `i` writable. Storage never shrinks.
    #[inline]
    pub fn validate(&mut self, i: usize) {
        if i >= self.refs.len() {
            let n = (i + 1).next_power_of_two();
            self.refs.resize(n, Ref::default());
        }
    }

    /// Commit length `n`; slots past the old length keep whatever was
    /// written into them
    #[inline]
    pub fn set_len(&mut self, n: usize) {
        if n > 0 {
            self.validate(n - 1);
        }
        self.len = n;
    }

    /// Write slot `i` without touching the length
    #[inline(always)]
    pub fn put(&mut self, i: usize, r: Ref) {
        self.validate(i);
        self.refs[i] = r;
    }

    /// Append and return the new length
    #[inline]
    pub fn push(&mut self, r: Ref) -> usize {
        let i = self.len;
        self.put(i, r);
        self.len = i + 1;
        self.len
    }

    pub fn extend_from_slice(&mut self, refs: &[Ref]) {
        let start = self.len;
        let end = start + refs.len();
        if end > 0 {
            self.validate(end - 1);
        }
        self.refs[start..end].copy_from_slice(refs);
        self.len = end;
    }

    #[inline]
    pub fn truncate(&mut self, n: usize) {
        self.len = self.len.min(n);
    }

    /// Drop all references, keeping storage
    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[Ref] {
        &self.refs[..self.len]
    }

    #[inline(always)]
    pub fn as_mut_slice(&mut self) -> &mut [Ref] {
        &mut self.refs[..self.len]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ref> {
        self.as_slice().iter()
    }
}

impl Index<usize> for RefVec {
    type Output = Ref;

    fn index(&self, i: usize) -> &Ref {
        &self.as_slice()[i]
    }
}

impl IndexMut<usize> for RefVec {
    fn index_mut(&mut self, i: usize) -> &mut Ref {
        &mut self.as_mut_slice()[i]
    }
}

impl From<Vec<Ref>> for RefVec {
    fn from(refs: Vec<Ref>) -> Self {
        let len = refs.len();
        Self { refs, len }
    }
}

/// Inbound batch for one node on one thread
#[derive(Debug, Clone)]
pub struct RefIn {
    pub refs: RefVec,
    thread_id: usize,
}

impl RefIn {
    pub fn new(thread_id: usize) -> Self {
        Self {
            refs: RefVec::new(),
            thread_id,
        }
    }

    pub fn from_refs(thread_id: usize, refs: Vec<Ref>) -> Self {
        Self {
            refs: refs.into(),
            thread_id,
        }
    }

    #[inline(always)]
    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    /// Mark the batch's thread as gone
    pub fn invalidate(&mut self) {
        self.thread_id = INVALID_THREAD;
    }

    #[inline(always)]
    pub fn is_valid(&self) -> bool {
        self.thread_id != INVALID_THREAD
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

/// Outbound batches of one node, one vector per next edge
#[derive(Debug, Clone)]
pub struct RefOut {
    pub outs: Vec<RefVec>,
    thread_id: usize,
}

impl RefOut {
    pub fn new(thread_id: usize, n_next: usize) -> Self {
        Self {
            outs: vec![RefVec::new(); n_next],
            thread_id,
        }
    }

    #[inline(always)]
    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    pub fn n_next(&self) -> usize {
        self.outs.len()
    }

    /// Make sure next index `next` has a vector
    #[inline]
    pub fn validate_next(&mut self, next: usize) {
        if next >= self.outs.len() {
            self.outs.resize(next + 1, RefVec::new());
        }
    }

    /// Committed references over all nexts
    pub fn total_len(&self) -> usize {
        self.outs.iter().map(RefVec::len).sum()
    }

    /// Reset every next vector for a new round
    pub fn clear(&mut self) {
        for o in &mut self.outs {
            o.clear();
        }
    }

    /// Move the vector for `next` into an inbound batch for the next node
    pub fn take_next(&mut self, next: usize) -> RefIn {
        let refs = std::mem::take(&mut self.outs[next]);
        RefIn {
            refs,
            thread_id: self.thread_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speculative_write_then_commit() {
        let mut v = RefVec::new();
        v.put(0, Ref::new(1, 0, 10));
        v.put(1, Ref::new(2, 0, 10));
        assert_eq!(v.len(), 0);
        assert!(v.capacity() >= 2);

        v.set_len(2);
        assert_eq!(v.as_slice().iter().map(|r| r.buffer()).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_clear_keeps_storage() {
        let mut v = RefVec::with_capacity(8);
        for i in 0..8 {
            v.push(Ref::new(i, 0, 0));
        }
        v.clear();
        assert!(v.is_empty());
        assert_eq!(v.capacity(), 8);
    }

    #[test]
    fn test_ref_out_take_next() {
        let mut out = RefOut::new(3, 2);
        out.outs[1].push(Ref::new(7, 0, 64));
        assert_eq!(out.total_len(), 1);

        let input = out.take_next(1);
        assert_eq!(input.thread_id(), 3);
        assert_eq!(input.len(), 1);
        assert_eq!(out.total_len(), 0);
    }

    #[test]
    fn test_invalidate() {
        let mut input = RefIn::new(0);
        assert!(input.is_valid());
        input.invalidate();
        assert!(!input.is_valid());
    }
}
