//! Exact distinct-count backend.
//!
//! Reference implementation holding every hash in memory. Used by tests
//! and regulated deployments where approximate answers are unacceptable;
//! memory grows linearly with the number of distinct users.

use std::collections::HashSet;

use super::SketchError;

#[derive(Debug, Clone, Default)]
pub struct ExactSketch {
    keys: HashSet<u64>,
}

impl ExactSketch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, hashed: u64) {
        self.keys.insert(hashed);
    }

    #[must_use]
    pub fn cardinality(&self) -> f64 {
        self.keys.len() as f64
    }

    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self {
            keys: self.keys.union(&other.keys).copied().collect(),
        }
    }

    #[must_use]
    pub fn diff(&self, removed: &[u64]) -> Self {
        let removed_set: HashSet<u64> = removed.iter().copied().collect();
        Self {
            keys: self.keys.difference(&removed_set).copied().collect(),
        }
    }

    #[must_use]
    pub fn contains(&self, hashed: u64) -> bool {
        self.keys.contains(&hashed)
    }

    /// Sorted encoding so equal sets serialize identically regardless of
    /// insertion order.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut sorted: Vec<u64> = self.keys.iter().copied().collect();
        sorted.sort_unstable();
        let mut payload = Vec::with_capacity(4 + sorted.len() * 8);
        payload.extend_from_slice(&(sorted.len() as u32).to_be_bytes());
        for h in sorted {
            payload.extend_from_slice(&h.to_be_bytes());
        }
        payload
    }

    /// # Errors
    /// Returns `Payload` for truncated or malformed input.
    pub fn deserialize(payload: &[u8]) -> Result<Self, SketchError> {
        if payload.len() < 4 {
            return Err(SketchError::Payload("set blob shorter than header".to_string()));
        }
        let count = u32::from_be_bytes(
            payload[..4]
                .try_into()
                .map_err(|_| SketchError::Payload("set header unreadable".to_string()))?,
        ) as usize;
        let body = &payload[4..];
        if body.len() < count * 8 {
            return Err(SketchError::Payload(format!(
                "set blob names {count} hashes but carries {}",
                body.len() / 8
            )));
        }
        let keys = body[..count * 8]
            .chunks_exact(8)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                u64::from_be_bytes(buf)
            })
            .collect();
        Ok(Self { keys })
    }
}
