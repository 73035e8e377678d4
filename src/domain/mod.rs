//! Domain layer: Core business types and logic.
//!
//! This module contains pure types with no I/O dependencies. Sketches,
//! events, pseudonymous keys and release mechanisms all live here.

pub mod event;
pub mod keys;
pub mod release;
pub mod sketch;

pub use event::{Event, Metric, Op};
pub use keys::{SaltEpoch, SaltSchedule, UserKey};
pub use release::{MechanismKind, MechanismResult, ReleaseRecord};
pub use sketch::{DaySketch, SketchConfig, SketchKind};
