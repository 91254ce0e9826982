//! Core domain logic for appraisal reports ("laudos periciais")
//!
//! This crate is shared by the API server and the sync client:
//! - `control`: human-readable control numbers (`RL 001-2024`)
//! - `data`: the typed, versioned report data document
//! - `merge`: deep merge and the default/server/local-cache restore
//! - `lenient`: tolerant deserializers for values typed into form inputs

pub mod control;
pub mod data;
pub mod error;
pub mod lenient;
pub mod merge;

pub use control::ControlNumber;
pub use data::{ReportData, CURRENT_SCHEMA_VERSION};
pub use error::CoreError;
pub use merge::{
    merge_deep, restore, ConflictPolicy, LocalSnapshot, RestoreSource, Restored, ServerState,
};
