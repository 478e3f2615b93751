//! Register Shadows
//!
//! Status words shared between an interrupt routine and the dispatch
//! thread. The routine ORs bits in; the consumer reads and clears in one
//! atomic step so no bit set in between is lost.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

macro_rules! reg {
    ($name:ident, $atomic:ty, $t:ty) => {
        #[derive(Debug, Default)]
        pub struct $name($atomic);

        impl $name {
            pub const fn new(v: $t) -> Self {
                Self(<$atomic>::new(v))
            }

            #[inline]
            pub fn get(&self) -> $t {
                self.0.load(Ordering::Acquire)
            }

            #[inline]
            pub fn set(&self, v: $t) {
                self.0.store(v, Ordering::Release)
            }

            /// Set `bits`, returning the new value
            #[inline]
            pub fn or(&self, bits: $t) -> $t {
                self.0.fetch_or(bits, Ordering::AcqRel) | bits
            }

            /// Return the value and zero it
            #[inline]
            pub fn read_clear(&self) -> $t {
                self.0.swap(0, Ordering::AcqRel)
            }
        }
    };
}

reg!(Reg32, AtomicU32, u32);
reg!(Reg64, AtomicU64, u64);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_or_then_read_clear() {
        let r = Reg32::new(0);
        r.or(0b01);
        assert_eq!(r.or(0b10), 0b11);
        assert_eq!(r.read_clear(), 0b11);
        assert_eq!(r.get(), 0);
    }

    #[test]
    fn test_no_bit_lost() {
        let r = Arc::new(Reg64::default());
        let setters: Vec<_> = (0..8)
            .map(|i| {
                let r = r.clone();
                std::thread::spawn(move || {
                    r.or(1 << i);
                })
            })
            .collect();

        let mut seen = 0;
        for s in setters {
            s.join().unwrap();
            seen |= r.read_clear();
        }
        seen |= r.read_clear();
        assert_eq!(seen, 0xff);
    }
}
