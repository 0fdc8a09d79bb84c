//! Refinement engine.
//!
//! Bounded values, duration profiles, the pass ladder, and the merge engine
//! that folds each pass's measurements into converging exposure records.

pub mod bounds;
pub mod merge;
pub mod passes;
pub mod profile;

pub use bounds::BoundedValue;
pub use merge::{AnomalyEvent, MergeEngine, MergeReport};
pub use passes::{PassConfiguration, PassLadder};
pub use profile::DurationProfile;
