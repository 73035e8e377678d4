//! # Countveil
//!
//! Differentially private distinct-user analytics over a turnstile event
//! stream. The engine ingests `(user_id, op, day)` events, maintains
//! per-day distinct-count sketches under pseudonymized identities, and
//! releases DAU / rolling-window MAU estimates with calibrated noise while
//! a persistent accountant tracks the (epsilon, delta) budget. Retroactive
//! user erasure is honored through tombstones and day rebuilds.
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture:
//! - `domain`: Core business types (events, pseudonymous keys, sketches,
//!   release mechanisms)
//! - `ports`: Trait definitions for external operations (ledger, noise)
//! - `adapters`: Concrete implementations (SQLite, ChaCha20 noise, HTTP)
//! - `application`: Use cases orchestrating domain and ports (windows,
//!   accountant, pipeline)

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

pub use application::accountant::BudgetExhausted;
pub use application::pipeline::Pipeline;
pub use config::AppConfig;

use domain::release::ReleaseError;
use domain::sketch::SketchError;
use ports::ledger::LedgerError;

/// Result type for Countveil operations
pub type Result<T> = std::result::Result<T, CountveilError>;

/// Main error type for Countveil
#[derive(Debug, thiserror::Error)]
pub enum CountveilError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Missing or invalid API key")]
    Unauthorized,

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Privacy budget exhausted for {}", .0.metric)]
    BudgetExhausted(Box<BudgetExhausted>),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Ledger operation failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Release computation failed: {0}")]
    Release(#[from] ReleaseError),

    #[error("Sketch operation failed: {0}")]
    Sketch(#[from] SketchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invariant violated: {0}")]
    Fatal(String),
}
