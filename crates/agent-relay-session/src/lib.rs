//! Client-side execution state for UI surfaces.
//!
//! Provides:
//! - `ClientSessionStore` - per-surface cache of execution conversations
//! - `ExecutionState` - one execution's messages, flags and feedback

pub mod execution;
pub mod store;

pub use execution::{ExecutionState, UpsertOutcome};
pub use store::{ClientSessionStore, EvictionPolicy};
