//! Bloom filter over 64-bit sketch hashes.
//!
//! Used to accelerate the "not in removed" membership test during sketch
//! difference. False positives cause over-deletion bounded by the
//! configured rate; false negatives cannot occur, so an erased key is
//! never resurrected.

use sha2::{Digest, Sha256};

/// Minimum bit count, so tiny inputs still get a usable filter.
const MIN_BITS: usize = 8;

#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    m: usize,
    k: u32,
}

impl BloomFilter {
    /// Size a filter for `values` at the requested false-positive rate and
    /// insert them all.
    #[must_use]
    pub fn build(values: &[u64], fp_rate: f64) -> Self {
        let n = values.len().max(1) as f64;
        let fp = fp_rate.clamp(1e-6, 1.0 - 1e-6);
        let ln2 = std::f64::consts::LN_2;
        let m = ((-(n * fp.ln()) / (ln2 * ln2)).ceil() as usize).max(MIN_BITS);
        let k = (((m as f64 / n) * ln2).round() as u32).max(1);

        let mut filter = Self {
            bits: vec![0u8; m.div_ceil(8)],
            m,
            k,
        };
        for &value in values {
            filter.insert(value);
        }
        filter
    }

    /// Double hashing: two independent 64-bit hashes from one digest
    /// drive all k probe positions.
    fn probes(&self, value: u64) -> (u64, u64) {
        let digest = Sha256::digest(value.to_be_bytes());
        let mut h1 = [0u8; 8];
        let mut h2 = [0u8; 8];
        h1.copy_from_slice(&digest[..8]);
        h2.copy_from_slice(&digest[8..16]);
        (u64::from_be_bytes(h1), u64::from_be_bytes(h2) | 1)
    }

    fn insert(&mut self, value: u64) {
        let (h1, h2) = self.probes(value);
        for i in 0..u64::from(self.k) {
            let idx = (h1.wrapping_add(i.wrapping_mul(h2)) % self.m as u64) as usize;
            self.bits[idx / 8] |= 1 << (idx % 8);
        }
    }

    #[must_use]
    pub fn contains(&self, value: u64) -> bool {
        let (h1, h2) = self.probes(value);
        for i in 0..u64::from(self.k) {
            let idx = (h1.wrapping_add(i.wrapping_mul(h2)) % self.m as u64) as usize;
            if self.bits[idx / 8] & (1 << (idx % 8)) == 0 {
                return false;
            }
        }
        true
    }
}
