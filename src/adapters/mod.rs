//! Adapters layer: Concrete implementations of the ports.

pub mod http;
pub mod noise;
pub mod sanitize;
pub mod sqlite;

pub use noise::{ChaChaNoise, ChaChaNoiseFactory};
pub use sqlite::SqliteLedger;
