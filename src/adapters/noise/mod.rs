//! ChaCha20 noise adapter: Implementation of `NoiseSource`.
//!
//! Each release constructs one generator from the seed recorded alongside
//! it, so any released value can be reproduced from the ledger. Seeds are
//! derived from OS entropy unless a deterministic root seed is configured
//! for tests.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::ports::noise::{NoiseFactory, NoiseSource};

/// CSPRNG-backed noise source.
pub struct ChaChaNoise {
    rng: ChaCha20Rng,
}

impl ChaChaNoise {
    #[must_use]
    pub fn seeded(seed: i64) -> Self {
        Self {
            rng: ChaCha20Rng::seed_from_u64(seed as u64),
        }
    }

    /// Uniform in (0, 1): endpoints are nudged off zero so the log in the
    /// inverse-CDF transforms stays finite.
    fn open_unit(&mut self) -> f64 {
        let u: f64 = self.rng.gen();
        if u == 0.0 {
            f64::MIN_POSITIVE
        } else {
            u
        }
    }
}

impl NoiseSource for ChaChaNoise {
    fn laplace(&mut self, scale: f64) -> f64 {
        if scale == 0.0 {
            return 0.0;
        }
        // Inverse CDF: u uniform in (-0.5, 0.5), noise = -b*sgn(u)*ln(1-2|u|)
        let u = self.open_unit() - 0.5;
        let inner: f64 = 1.0 - 2.0 * u.abs();
        -scale * u.signum() * inner.max(f64::MIN_POSITIVE).ln()
    }

    fn gaussian(&mut self, sigma: f64) -> f64 {
        if sigma == 0.0 {
            return 0.0;
        }
        // Box-Muller transform
        let u1 = self.open_unit();
        let u2: f64 = self.rng.gen();
        sigma * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }
}

/// Factory handed to the pipeline; one seeded generator per release.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChaChaNoiseFactory;

impl NoiseFactory for ChaChaNoiseFactory {
    type Source = ChaChaNoise;

    fn seeded(&self, seed: i64) -> ChaChaNoise {
        ChaChaNoise::seeded(seed)
    }
}
