//! Theta sketch backend.
//!
//! Bottom-k sampling with an explicit threshold theta: every retained hash
//! lies below theta, and the estimate is `retained / theta` with theta
//! normalized to (0, 1]. Carrying theta explicitly lets union lower the
//! threshold to the smaller of the two operands before re-trimming, and
//! set difference keeps theta fixed so removals never bias the sampling
//! probability.

use std::collections::HashSet;

use super::{SketchConfig, SketchError};

#[derive(Debug, Clone)]
pub struct ThetaSketch {
    k: usize,
    /// Sampling threshold; `u64::MAX` until the sketch saturates
    theta: u64,
    /// Retained hashes, sorted ascending, all strictly below `theta`
    hashes: Vec<u64>,
    members: HashSet<u64>,
}

impl ThetaSketch {
    #[must_use]
    pub fn new(config: SketchConfig) -> Self {
        Self {
            k: config.k,
            theta: u64::MAX,
            hashes: Vec::new(),
            members: HashSet::new(),
        }
    }

    fn from_parts(k: usize, theta: u64, hashes: impl IntoIterator<Item = u64>) -> Self {
        let mut unique: Vec<u64> = hashes
            .into_iter()
            .filter(|&h| h < theta)
            .collect::<HashSet<u64>>()
            .into_iter()
            .collect();
        unique.sort_unstable();
        let mut sketch = Self {
            k,
            theta,
            hashes: unique,
            members: HashSet::new(),
        };
        sketch.trim();
        sketch.members = sketch.hashes.iter().copied().collect();
        sketch
    }

    /// Evict the largest entries until at most k remain, lowering theta to
    /// each evicted value.
    fn trim(&mut self) {
        while self.hashes.len() > self.k {
            if let Some(evicted) = self.hashes.pop() {
                self.theta = evicted;
            }
        }
    }

    pub fn add(&mut self, hashed: u64) {
        if hashed >= self.theta || self.members.contains(&hashed) {
            return;
        }
        let pos = self.hashes.partition_point(|&h| h < hashed);
        self.hashes.insert(pos, hashed);
        self.members.insert(hashed);
        if self.hashes.len() > self.k {
            if let Some(evicted) = self.hashes.pop() {
                self.theta = evicted;
                self.members.remove(&evicted);
            }
        }
    }

    fn theta_normalized(&self) -> f64 {
        self.theta as f64 / u64::MAX as f64
    }

    #[must_use]
    pub fn cardinality(&self) -> f64 {
        if self.theta == u64::MAX {
            return self.hashes.len() as f64;
        }
        let tau = self.theta_normalized();
        if tau <= 0.0 {
            return self.hashes.len() as f64;
        }
        self.hashes.len() as f64 / tau
    }

    /// Union under the smaller threshold.
    ///
    /// # Errors
    /// Returns `Mismatch` when the sketches were sized differently.
    pub fn union(&self, other: &Self) -> Result<Self, SketchError> {
        if self.k != other.k {
            return Err(SketchError::Mismatch {
                left: "theta",
                right: "theta (different k)",
            });
        }
        let theta = self.theta.min(other.theta);
        Ok(Self::from_parts(
            self.k,
            theta,
            self.hashes.iter().chain(other.hashes.iter()).copied(),
        ))
    }

    /// Drop removed hashes while keeping theta fixed, so the survivors'
    /// sampling probability is unchanged and the estimate tracks `|A \ R|`.
    #[must_use]
    pub fn diff(&self, removed: &[u64]) -> Self {
        let removed_set: HashSet<u64> = removed.iter().copied().collect();
        let kept: Vec<u64> = self
            .hashes
            .iter()
            .copied()
            .filter(|h| !removed_set.contains(h))
            .collect();
        let members = kept.iter().copied().collect();
        Self {
            k: self.k,
            theta: self.theta,
            hashes: kept,
            members,
        }
    }

    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(16 + self.hashes.len() * 8);
        payload.extend_from_slice(&(self.k as u32).to_be_bytes());
        payload.extend_from_slice(&self.theta.to_be_bytes());
        payload.extend_from_slice(&(self.hashes.len() as u32).to_be_bytes());
        for &h in &self.hashes {
            payload.extend_from_slice(&h.to_be_bytes());
        }
        payload
    }

    /// # Errors
    /// Returns `Payload` for truncated or malformed input.
    pub fn deserialize(payload: &[u8], config: SketchConfig) -> Result<Self, SketchError> {
        if payload.len() < 16 {
            return Err(SketchError::Payload("theta blob shorter than header".to_string()));
        }
        let theta = u64::from_be_bytes(
            payload[4..12]
                .try_into()
                .map_err(|_| SketchError::Payload("theta header unreadable".to_string()))?,
        );
        let count = u32::from_be_bytes(
            payload[12..16]
                .try_into()
                .map_err(|_| SketchError::Payload("theta header unreadable".to_string()))?,
        ) as usize;
        let body = &payload[16..];
        if body.len() < count * 8 {
            return Err(SketchError::Payload(format!(
                "theta blob names {count} hashes but carries {}",
                body.len() / 8
            )));
        }
        let hashes = body[..count * 8].chunks_exact(8).map(|chunk| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            u64::from_be_bytes(buf)
        });
        Ok(Self::from_parts(config.k, theta, hashes))
    }
}
