//! KMV bottom-k distinct-count sketch.
//!
//! Keeps the k smallest 64-bit hashes seen. Below saturation the estimate
//! is exact; at saturation it is `(k-1) / t_k` where `t_k` is the k-th
//! smallest hash normalized to (0, 1]. Union merges and re-trims; set
//! difference filters the retained hashes against the removed keys,
//! optionally through a Bloom filter whose false positives over-delete by
//! at most the configured rate.

use std::collections::HashSet;

use super::bloom::BloomFilter;
use super::{SketchConfig, SketchError, EXACT_DIFF_MAX};

#[derive(Debug, Clone)]
pub struct KmvSketch {
    config: SketchConfig,
    /// The retained hashes, sorted ascending, at most `config.k` entries
    hashes: Vec<u64>,
    members: HashSet<u64>,
}

impl KmvSketch {
    #[must_use]
    pub fn new(config: SketchConfig) -> Self {
        Self {
            config,
            hashes: Vec::new(),
            members: HashSet::new(),
        }
    }

    /// Build from raw hashes, deduplicating and trimming to the k smallest.
    #[must_use]
    pub fn from_hashes(config: SketchConfig, hashes: impl IntoIterator<Item = u64>) -> Self {
        let mut unique: Vec<u64> = hashes
            .into_iter()
            .collect::<HashSet<u64>>()
            .into_iter()
            .collect();
        unique.sort_unstable();
        unique.truncate(config.k);
        let members = unique.iter().copied().collect();
        Self {
            config,
            hashes: unique,
            members,
        }
    }

    pub fn add(&mut self, hashed: u64) {
        if self.members.contains(&hashed) {
            return;
        }
        if self.hashes.len() >= self.config.k {
            let largest = *self.hashes.last().unwrap_or(&u64::MAX);
            if hashed >= largest {
                return;
            }
        }
        let pos = self.hashes.partition_point(|&h| h < hashed);
        self.hashes.insert(pos, hashed);
        self.members.insert(hashed);
        while self.hashes.len() > self.config.k {
            if let Some(removed) = self.hashes.pop() {
                self.members.remove(&removed);
            }
        }
    }

    fn threshold(&self) -> f64 {
        match self.hashes.last() {
            Some(&largest) if self.hashes.len() >= self.config.k => {
                largest as f64 / u64::MAX as f64
            }
            _ => 1.0,
        }
    }

    #[must_use]
    pub fn cardinality(&self) -> f64 {
        if self.hashes.is_empty() {
            return 0.0;
        }
        if self.hashes.len() < self.config.k {
            return self.hashes.len() as f64;
        }
        let tau = self.threshold();
        if tau <= 0.0 {
            return self.hashes.len() as f64;
        }
        (self.config.k - 1) as f64 / tau
    }

    /// Merge-and-keep-smallest-k.
    ///
    /// # Errors
    /// Returns `Mismatch` when the sketches were sized differently.
    pub fn union(&self, other: &Self) -> Result<Self, SketchError> {
        if self.config.k != other.config.k {
            return Err(SketchError::Mismatch {
                left: "kmv",
                right: "kmv (different k)",
            });
        }
        Ok(Self::from_hashes(
            self.config,
            self.hashes.iter().chain(other.hashes.iter()).copied(),
        ))
    }

    /// Estimate `|A \ R|` by filtering the retained hashes through
    /// "not in removed".
    ///
    /// With the Bloom path, removed keys are always caught (no false
    /// negatives) while false positives over-delete survivors with
    /// probability at most the configured rate.
    #[must_use]
    pub fn diff(&self, removed: &[u64]) -> Self {
        if removed.is_empty() {
            return self.clone();
        }

        let kept: Vec<u64> = if self.config.use_bloom_for_diff && removed.len() > EXACT_DIFF_MAX {
            let filter = BloomFilter::build(removed, self.config.bloom_fp_rate);
            self.hashes
                .iter()
                .copied()
                .filter(|h| !filter.contains(*h))
                .collect()
        } else {
            let removed_set: HashSet<u64> = removed.iter().copied().collect();
            self.hashes
                .iter()
                .copied()
                .filter(|h| !removed_set.contains(h))
                .collect()
        };
        Self::from_hashes(self.config, kept)
    }

    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(8 + self.hashes.len() * 8);
        payload.extend_from_slice(&(self.config.k as u32).to_be_bytes());
        payload.extend_from_slice(&(self.hashes.len() as u32).to_be_bytes());
        for &h in &self.hashes {
            payload.extend_from_slice(&h.to_be_bytes());
        }
        payload
    }

    /// Rehydrate from a persisted blob, honoring the runtime `k` if the
    /// blob was written under a different configuration.
    ///
    /// # Errors
    /// Returns `Payload` for truncated or malformed input.
    pub fn deserialize(payload: &[u8], config: SketchConfig) -> Result<Self, SketchError> {
        if payload.len() < 8 {
            return Err(SketchError::Payload("kmv blob shorter than header".to_string()));
        }
        let count = u32::from_be_bytes(
            payload[4..8]
                .try_into()
                .map_err(|_| SketchError::Payload("kmv header unreadable".to_string()))?,
        ) as usize;
        let body = &payload[8..];
        if body.len() < count * 8 {
            return Err(SketchError::Payload(format!(
                "kmv blob names {count} hashes but carries {}",
                body.len() / 8
            )));
        }
        let hashes = body[..count * 8].chunks_exact(8).map(|chunk| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            u64::from_be_bytes(buf)
        });
        Ok(Self::from_hashes(config, hashes))
    }

    #[must_use]
    pub fn retained(&self) -> usize {
        self.hashes.len()
    }
}
