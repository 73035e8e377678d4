//! In-memory sliding-window rate limiter for the ingest boundary.
//!
//! State is process-local and intentionally not persisted. Clients are
//! keyed by API key prefix when present, otherwise by forwarded address.
//! A hard cap on tracked clients bounds memory regardless of how many
//! distinct keys an abuser invents; at the cap, unknown clients are
//! rejected rather than tracked.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per client inside the window
    pub max_requests: u32,

    /// Sliding window length in seconds
    pub window_secs: u64,

    /// Hard cap on distinct clients tracked
    pub max_tracked_clients: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 600,
            window_secs: 60,
            max_tracked_clients: 10_000,
        }
    }
}

/// Sliding-window limiter over request timestamps per client.
pub struct RateLimiter {
    config: RateLimitConfig,
    state: RwLock<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: RwLock::new(HashMap::new()),
        }
    }

    /// Admit or reject one request for `client`.
    ///
    /// # Errors
    /// Returns the suggested `Retry-After` seconds when the client is over
    /// its window budget or the tracker is saturated by other clients.
    pub fn try_acquire(&self, client: &str) -> Result<(), u64> {
        let now = Instant::now();
        let window = Duration::from_secs(self.config.window_secs);

        let mut state = match self.state.write() {
            Ok(state) => state,
            // A poisoned limiter fails open: dropping requests because an
            // unrelated thread panicked would turn a bug into an outage.
            Err(_) => return Ok(()),
        };

        if !state.contains_key(client) && state.len() >= self.config.max_tracked_clients {
            state.retain(|_, stamps| {
                stamps.retain(|t| now.duration_since(*t) < window);
                !stamps.is_empty()
            });
            if state.len() >= self.config.max_tracked_clients {
                return Err(self.config.window_secs);
            }
        }

        let stamps = state.entry(client.to_string()).or_default();
        stamps.retain(|t| now.duration_since(*t) < window);
        if stamps.len() >= self.config.max_requests as usize {
            let oldest = stamps.iter().min().copied().unwrap_or(now);
            let elapsed = now.duration_since(oldest).as_secs();
            return Err(self.config.window_secs.saturating_sub(elapsed).max(1));
        }
        stamps.push(now);
        Ok(())
    }

    /// Remaining budget for a client, for response headers.
    #[must_use]
    pub fn remaining(&self, client: &str) -> u32 {
        let now = Instant::now();
        let window = Duration::from_secs(self.config.window_secs);
        let state = match self.state.read() {
            Ok(state) => state,
            Err(_) => return self.config.max_requests,
        };
        let used = state
            .get(client)
            .map(|stamps| {
                stamps
                    .iter()
                    .filter(|t| now.duration_since(**t) < window)
                    .count()
            })
            .unwrap_or(0);
        self.config.max_requests.saturating_sub(used as u32)
    }

    #[must_use]
    pub fn limit(&self) -> u32 {
        self.config.max_requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_requests,
            window_secs: 60,
            max_tracked_clients: 4,
        })
    }

    #[test]
    fn test_under_limit_admitted() {
        let limiter = limiter(3);
        for _ in 0..3 {
            limiter.try_acquire("a").expect("Should admit");
        }
        assert_eq!(limiter.remaining("a"), 0);
    }

    #[test]
    fn test_over_limit_rejected_with_retry_after() {
        let limiter = limiter(2);
        limiter.try_acquire("a").expect("Should admit");
        limiter.try_acquire("a").expect("Should admit");
        let retry_after = limiter.try_acquire("a").expect_err("Should reject");
        assert!(retry_after >= 1);
    }

    #[test]
    fn test_clients_isolated() {
        let limiter = limiter(1);
        limiter.try_acquire("a").expect("Should admit");
        limiter.try_acquire("b").expect("Should admit b independently");
        assert!(limiter.try_acquire("a").is_err());
    }

    #[test]
    fn test_tracked_client_cap() {
        let limiter = limiter(10);
        for client in ["a", "b", "c", "d"] {
            limiter.try_acquire(client).expect("Should admit");
        }
        // All four slots hold fresh stamps, so a fifth client is rejected.
        assert!(limiter.try_acquire("e").is_err());
        // Existing clients keep working.
        limiter.try_acquire("a").expect("Should still admit");
    }
}
