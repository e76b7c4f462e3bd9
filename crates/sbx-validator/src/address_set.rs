//! Compact bitsets over code-segment byte offsets.
//!
//! Branch validation keeps three of these per run and touches them once per
//! instruction plus once per recorded target, so membership operations must
//! stay O(1) and allocation-free after construction. The backing store is a
//! plain byte array: bit `offset & 7` of byte `offset >> 3`.

use std::collections::TryReserveError;

/// Fixed-size bitset over `[0, size)` byte offsets.
#[derive(Debug, Clone)]
pub struct AddressSet {
    bits: Vec<u8>,
    size: u64,
}

fn byte_index(offset: u64) -> usize {
    (offset >> 3) as usize
}

fn bit_mask(offset: u64) -> u8 {
    1 << (offset & 7)
}

impl AddressSet {
    /// Number of backing bytes for a set covering `size` offsets. One spare
    /// entry covers partial overlap at the end.
    pub fn array_size(size: u64) -> usize {
        byte_index(size) + 1
    }

    /// Allocate a zeroed set covering `[0, size)`. Fails (instead of
    /// aborting) when the allocation cannot be satisfied.
    pub fn new(size: u64) -> Result<Self, TryReserveError> {
        let len = Self::array_size(size);
        let mut bits = Vec::new();
        bits.try_reserve_exact(len)?;
        bits.resize(len, 0);
        Ok(Self { bits, size })
    }

    /// Mark `offset` as a member. The caller guarantees `offset < size`;
    /// this is validated once at the range check in the jump analysis.
    pub fn add(&mut self, offset: u64) {
        debug_assert!(offset < self.size);
        self.bits[byte_index(offset)] |= bit_mask(offset);
    }

    /// Membership test. Out-of-range offsets are never members.
    pub fn contains(&self, offset: u64) -> bool {
        if offset >= self.size {
            return false;
        }
        self.bits[byte_index(offset)] & bit_mask(offset) != 0
    }

    /// The raw backing bytes, for bulk reconciliation of several sets.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Number of offsets the set covers.
    pub fn size(&self) -> u64 {
        self.size
    }
}
