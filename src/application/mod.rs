//! Application layer: Use cases orchestrating domain and ports.

pub mod accountant;
pub mod files;
pub mod pipeline;
pub mod synthetic;
pub mod windows;

pub use accountant::{BudgetExhausted, BudgetSnapshot, PrivacyAccountant};
pub use pipeline::{Pipeline, ReleaseOutput};
pub use windows::WindowStore;
