//! Ports layer: Trait definitions for external operations.
//!
//! Following Hexagonal Architecture, these traits define the boundaries
//! between the application and external systems (persistence, RNG).

pub mod ledger;
pub mod noise;

pub use ledger::{ActivityRow, ErasureRequest, ErasureStatus, Ledger, LedgerError, NewErasure};
pub use noise::{NoiseFactory, NoiseSource};
