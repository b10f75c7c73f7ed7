//! Process-wide hash allocation for handles.
//!
//! Every handle takes the next value of a single atomic counter. The stride
//! is twice the 32-bit Fibonacci constant, so hashes are even and the bucket
//! index `(hash >> 1) & mask` advances by an odd step for each new handle.
//! Successive handles therefore land in well separated buckets for every
//! power-of-two table size.

use core::sync::atomic::{AtomicU32, Ordering};

const HASH_INCREMENT: u32 = 0x61c8_8647u32.wrapping_mul(2);

static NEXT_HASH: AtomicU32 = AtomicU32::new(0);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct KeyHash(u32);

impl KeyHash {
    /// Allocate the hash for a newly constructed handle.
    pub(crate) fn next() -> Self {
        // Only uniqueness of the RMW matters, no ordering with other memory.
        KeyHash(NEXT_HASH.fetch_add(HASH_INCREMENT, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u32) -> Self {
        debug_assert!(raw % 2 == 0, "key hashes are even");
        KeyHash(raw)
    }

    /// First pair slot probed for this hash in a table with `mask + 1` pairs.
    #[inline]
    pub(crate) fn bucket(self, mask: usize) -> usize {
        (self.0 >> 1) as usize & mask
    }
}
