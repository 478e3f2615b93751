//! Enqueue / Redirect Engine
//!
//! Distributes an input batch across a node's next vectors. A per-thread
//! `(next, count)` cache lets runs of references bound for the same next
//! be written without touching that vector's length; the run is committed
//! when the cache switches or the node finishes.
//!
//! `put2` and `put4` write speculatively into the cached next and fall
//! back to `put1` per reference on any mismatch, so their result is always
//! the same as calling `put1` in order.

use crate::buffer::Ref;
use crate::counters::ErrorRef;
use crate::vector::{RefIn, RefOut};
use crate::{VnetError, VnetResult};

/// Cached next of one node on one thread
#[derive(Debug, Clone, Default)]
pub struct Enqueue {
    next: usize,
    n: usize,
}

impl Enqueue {
    pub fn cached_next(&self) -> usize {
        self.next
    }
}

/// Enqueue cache bound to the output batch of one dispatch
pub struct EnqueueOut<'a> {
    q: &'a mut Enqueue,
    out: &'a mut RefOut,
}

impl<'a> EnqueueOut<'a> {
    /// Start a dispatch; the cached next survives from the last one
    pub fn new(q: &'a mut Enqueue, out: &'a mut RefOut) -> Self {
        if q.next >= out.n_next() {
            q.next = 0;
        }
        out.validate_next(q.next);
        q.n = out.outs[q.next].len();
        Self { q, out }
    }

    /// Currently cached next index
    pub fn cached_next(&self) -> usize {
        self.q.next
    }

    /// Enqueue one reference to next `x0`
    #[inline]
    pub fn put1(&mut self, r0: Ref, x0: usize) {
        if x0 == self.q.next {
            self.out.outs[x0].put(self.q.n, r0);
            self.q.n += 1;
        } else {
            self.put(r0, x0);
        }
    }

    #[inline]
    fn put(&mut self, r0: Ref, x0: usize) {
        self.out.validate_next(x0);
        self.out.outs[x0].push(r0);
    }

    fn set_cached_next(&mut self, x0: usize) {
        self.sync();
        self.q.next = x0;
        self.q.n = self.out.outs[x0].len();
    }

    /// Enqueue two references
    #[inline]
    pub fn put2(&mut self, r0: Ref, r1: Ref, x0: usize, x1: usize) {
        // Speculatively enqueue both refs to cached next.
        let (x, n0) = (self.q.next, self.q.n);
        let o = &mut self.out.outs[x];
        o.put(n0, r0);
        o.put(n0 + 1, r1);
        self.q.n = n0 + 2;

        let same = x0 == x1;
        if same && x0 == x {
            return;
        }

        self.q.n = n0;
        self.put1(r0, x0);
        self.put1(r1, x1);

        // Both missed the cache and agree: switch.
        if same {
            self.set_cached_next(x0);
        }
    }

    /// Enqueue four references
    #[inline]
    pub fn put4(&mut self, r: [Ref; 4], x: [usize; 4]) {
        let (c, n0) = (self.q.next, self.q.n);
        let o = &mut self.out.outs[c];
        o.put(n0, r[0]);
        o.put(n0 + 1, r[1]);
        o.put(n0 + 2, r[2]);
        o.put(n0 + 3, r[3]);
        self.q.n = n0 + 4;

        if x[0] == c && x[0] == x[1] && x[2] == x[3] && x[0] == x[2] {
            return;
        }

        self.q.n = n0;
        self.put1(r[0], x[0]);
        self.put1(r[1], x[1]);
        self.put1(r[2], x[2]);
        self.put1(r[3], x[3]);

        // Last two missed the cache and agree: switch.
        if x[2] != c && x[2] == x[3] {
            self.set_cached_next(x[2]);
        }
    }

    /// Send the whole input batch to one next
    pub fn redirect(&mut self, input: &RefIn, next: usize) {
        self.sync();
        self.out.validate_next(next);
        self.out.outs[next].extend_from_slice(input.refs.as_slice());
        if next == self.q.next {
            self.q.n = self.out.outs[next].len();
        }
    }

    /// Send the whole input batch to one next, tagging each ref with `err`
    pub fn error_redirect(&mut self, input: &RefIn, next: usize, err: ErrorRef) {
        self.sync();
        self.out.validate_next(next);
        let o = &mut self.out.outs[next];
        let start = o.len();
        o.extend_from_slice(input.refs.as_slice());
        for r in &mut o.as_mut_slice()[start..] {
            r.set_error(err);
        }
        if next == self.q.next {
            self.q.n = self.out.outs[next].len();
        }
    }

    /// Commit the cached run to its vector
    #[inline]
    pub fn sync(&mut self) {
        let o = &mut self.out.outs[self.q.next];
        if self.q.n > o.len() {
            o.set_len(self.q.n);
        }
    }

    /// Check that the node did not produce more than it consumed
    pub fn validate(&self, in_len: usize, checks: bool) -> VnetResult<()> {
        if !checks {
            return Ok(());
        }
        let out_len = self.out.total_len();
        if out_len > in_len {
            return Err(VnetError::OutputOverflow { out_len, in_len });
        }
        Ok(())
    }

    /// References bound for `next`, including the uncommitted cached run
    pub fn len(&self, next: usize) -> usize {
        let committed = self.out.outs.get(next).map_or(0, |o| o.len());
        if next == self.q.next {
            committed.max(self.q.n)
        } else {
            committed
        }
    }

    /// Output batch; committed lengths only until `sync`
    pub fn out(&self) -> &RefOut {
        &*self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn refs(n: usize) -> Vec<Ref> {
        (0..n as u32).map(|i| Ref::new(i, 0, 64)).collect()
    }

    fn contents(out: &RefOut) -> Vec<Vec<u32>> {
        out.outs
            .iter()
            .map(|o| o.iter().map(|r| r.buffer()).collect())
            .collect()
    }

    fn run_put1(rs: &[Ref], xs: &[usize], n_next: usize, q: &mut Enqueue) -> RefOut {
        let mut out = RefOut::new(0, n_next);
        let mut eo = EnqueueOut::new(q, &mut out);
        for (r, &x) in rs.iter().zip(xs) {
            eo.put1(*r, x);
        }
        eo.sync();
        out
    }

    fn run_put4(rs: &[Ref], xs: &[usize], n_next: usize, q: &mut Enqueue) -> RefOut {
        let mut out = RefOut::new(0, n_next);
        let mut eo = EnqueueOut::new(q, &mut out);
        let mut i = 0;
        while i + 4 <= rs.len() {
            eo.put4(
                [rs[i], rs[i + 1], rs[i + 2], rs[i + 3]],
                [xs[i], xs[i + 1], xs[i + 2], xs[i + 3]],
            );
            i += 4;
        }
        while i < rs.len() {
            eo.put1(rs[i], xs[i]);
            i += 1;
        }
        eo.sync();
        out
    }

    fn run_put2(rs: &[Ref], xs: &[usize], n_next: usize, q: &mut Enqueue) -> RefOut {
        let mut out = RefOut::new(0, n_next);
        let mut eo = EnqueueOut::new(q, &mut out);
        let mut i = 0;
        while i + 2 <= rs.len() {
            eo.put2(rs[i], rs[i + 1], xs[i], xs[i + 1]);
            i += 2;
        }
        if i < rs.len() {
            eo.put1(rs[i], xs[i]);
        }
        eo.sync();
        out
    }

    #[test]
    fn test_cached_run_is_committed_on_sync() {
        let mut q = Enqueue::default();
        let mut out = RefOut::new(0, 2);
        let mut eo = EnqueueOut::new(&mut q, &mut out);
        for r in refs(3) {
            eo.put1(r, 0);
        }
        assert_eq!(eo.len(0), 3);
        assert_eq!(eo.out().outs[0].len(), 0);
        eo.sync();
        assert_eq!(out.outs[0].len(), 3);
    }

    #[test]
    fn test_put4_switches_cache() {
        let mut q = Enqueue::default();
        let mut out = RefOut::new(0, 3);
        let rs = refs(8);
        let mut eo = EnqueueOut::new(&mut q, &mut out);
        eo.put4([rs[0], rs[1], rs[2], rs[3]], [2, 2, 2, 2]);
        assert_eq!(eo.cached_next(), 2);
        eo.put4([rs[4], rs[5], rs[6], rs[7]], [2, 2, 2, 2]);
        eo.sync();
        assert_eq!(contents(&out)[2], (0..8).collect::<Vec<_>>());
        assert_eq!(q.cached_next(), 2);
    }

    #[test]
    fn test_cache_persists_across_dispatches() {
        let mut q = Enqueue::default();
        let rs = refs(4);
        run_put4(&rs, &[1, 1, 1, 1], 2, &mut q);
        assert_eq!(q.cached_next(), 1);

        let out = run_put1(&rs, &[1, 1, 0, 1], 2, &mut q);
        assert_eq!(contents(&out), vec![vec![2], vec![0, 1, 3]]);
    }

    #[test]
    fn test_redirect_and_error_redirect() {
        let mut q = Enqueue::default();
        let mut out = RefOut::new(0, 2);
        let input = RefIn::from_refs(0, refs(3));
        let mut eo = EnqueueOut::new(&mut q, &mut out);
        eo.put1(Ref::new(9, 0, 0), 0);
        eo.redirect(&input, 0);
        eo.error_redirect(&input, 1, ErrorRef::from_aux(7));
        eo.sync();

        assert_eq!(contents(&out), vec![vec![9, 0, 1, 2], vec![0, 1, 2]]);
        assert!(out.outs[1].iter().all(|r| r.aux() == 7));
    }

    #[test]
    fn test_validate_output_overflow() {
        let mut q = Enqueue::default();
        let mut out = RefOut::new(0, 1);
        let mut eo = EnqueueOut::new(&mut q, &mut out);
        for r in refs(3) {
            eo.put1(r, 0);
        }
        eo.sync();
        assert!(eo.validate(3, true).is_ok());
        assert!(matches!(
            eo.validate(2, true),
            Err(VnetError::OutputOverflow { out_len: 3, in_len: 2 })
        ));
        assert!(eo.validate(2, false).is_ok());
    }

    proptest! {
        #[test]
        fn prop_batched_puts_match_put1(
            xs in proptest::collection::vec(0usize..4, 0..300),
            start in 0usize..4,
        ) {
            let rs = refs(xs.len());
            let mut q1 = Enqueue { next: start, n: 0 };
            let mut q2 = q1.clone();
            let mut q4 = q1.clone();

            let a = run_put1(&rs, &xs, 4, &mut q1);
            let b = run_put2(&rs, &xs, 4, &mut q2);
            let c = run_put4(&rs, &xs, 4, &mut q4);

            prop_assert_eq!(a.total_len(), xs.len());
            prop_assert_eq!(c.total_len(), xs.len());
            prop_assert_eq!(contents(&a), contents(&b));
            prop_assert_eq!(contents(&a), contents(&c));
        }
    }
}
