// SPDX-License-Identifier: MIT

//! A rolling bloom filter used to remember the inventories and addresses
//! we already announced to (or heard from) a peer.
//!
//! Two generations are kept: inserts go into the current one, membership
//! checks look at both. When the current generation fills up, the old one
//! is dropped and the current one takes its place. The filter therefore
//! remembers at least `items` and at most `2 * items` recent entries,
//! with no false negatives inside that span.

use std::io::Cursor;

use bitvec::prelude::BitVec;
use bitvec::prelude::Lsb0;

/// Probabilistic membership over the last `items`..`2 * items` inserts.
#[derive(Debug, Clone)]
pub struct RollingFilter {
    current: BitVec<u8, Lsb0>,
    previous: BitVec<u8, Lsb0>,
    /// Size of each generation in bits (m)
    bits: usize,
    /// Number of hash functions (k)
    hashes: u32,
    /// Inserts into the current generation
    count: usize,
    /// Generation capacity (n)
    items: usize,
}

impl RollingFilter {
    /// Create a filter sized for `items` elements per generation at the
    /// given false positive rate.
    pub fn new(items: usize, fpr: f64) -> Self {
        let n = items.max(1) as f64;
        let m = (-n * fpr.ln() / core::f64::consts::LN_2.powi(2)).ceil() as usize;
        let m = m.max(8);
        let k = ((m as f64 / n) * core::f64::consts::LN_2).round().max(1.0) as u32;

        RollingFilter {
            current: BitVec::repeat(false, m),
            previous: BitVec::repeat(false, m),
            bits: m,
            hashes: k,
            count: 0,
            items: items.max(1),
        }
    }

    /// Double hashing: position_i = h1 + i * h2 (mod m), with h1 and h2
    /// drawn from murmur3 under two fixed seeds.
    fn positions(&self, data: &[u8]) -> impl Iterator<Item = usize> {
        let h1 = murmur3::murmur3_32(&mut Cursor::new(data), 0).unwrap_or(0) as u64;
        let h2 = murmur3::murmur3_32(&mut Cursor::new(data), 1).unwrap_or(0) as u64;
        let m = self.bits as u64;
        let k = self.hashes as u64;

        (0..k).map(move |i| ((h1.wrapping_add(i.wrapping_mul(h2))) % m) as usize)
    }

    /// Insert an element. Rotates generations when the current one is at
    /// capacity.
    pub fn insert(&mut self, data: &[u8]) {
        if self.count >= self.items {
            core::mem::swap(&mut self.previous, &mut self.current);
            self.current.fill(false);
            self.count = 0;
        }

        for pos in self.positions(data) {
            self.current.set(pos, true);
        }

        self.count += 1;
    }

    /// Probabilistic membership test. Never false-negative for anything
    /// inserted within the last generation.
    pub fn contains(&self, data: &[u8]) -> bool {
        let in_current = self.positions(data).all(|pos| self.current[pos]);
        if in_current {
            return true;
        }

        self.positions(data).all(|pos| self.previous[pos])
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        self.current.fill(false);
        self.previous.fill(false);
        self.count = 0;
    }
}

#[cfg(test)]
mod test {
    use super::RollingFilter;

    #[test]
    fn test_membership() {
        let mut filter = RollingFilter::new(100, 0.001);

        assert!(!filter.contains(b"hello"));
        filter.insert(b"hello");
        assert!(filter.contains(b"hello"));
        assert!(!filter.contains(b"world"));
    }

    #[test]
    fn test_no_false_negatives_within_generation() {
        let mut filter = RollingFilter::new(1000, 0.000001);
        let keys: Vec<[u8; 32]> = (0u32..1000)
            .map(|i| {
                let mut key = [0u8; 32];
                key[..4].copy_from_slice(&i.to_le_bytes());
                key
            })
            .collect();

        for key in &keys {
            filter.insert(key);
        }

        for key in &keys {
            assert!(filter.contains(key));
        }
    }

    #[test]
    fn test_rotation_keeps_previous_generation() {
        let mut filter = RollingFilter::new(10, 0.001);

        filter.insert(b"first");
        for i in 0u32..10 {
            filter.insert(&i.to_le_bytes());
        }

        // "first" now lives in the previous generation
        assert!(filter.contains(b"first"));

        // Another full generation pushes it out entirely
        for i in 10u32..20 {
            filter.insert(&i.to_le_bytes());
        }
        assert!(!filter.contains(b"first"));
    }

    #[test]
    fn test_reset() {
        let mut filter = RollingFilter::new(10, 0.001);
        filter.insert(b"x");
        filter.reset();
        assert!(!filter.contains(b"x"));
    }
}
