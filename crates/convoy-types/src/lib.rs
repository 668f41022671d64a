//! # Convoy Types
//!
//! Core types, models, and error definitions for the Convoy sync
//! coordinator.
//!
//! - **`error`** - Typed error hierarchy for election, state, and config
//! - **`models`** - Domain models (LeaseRecord, SyncEntity, ConflictRecord,
//!   SyncJob, Role)
//!
//! This crate sits at the bottom of the dependency graph:
//!
//! ```text
//!          convoy-types (this crate)
//!                 │
//!                 ▼
//!            convoy-core
//!                 │
//!                 ▼
//!           convoy-server
//! ```
//!
//! All types are designed to be serializable via serde, cheap to clone
//! across async boundaries, and comparable for testing.

pub mod error;
pub mod models;

pub use error::{CoordinatorError, CoordinatorResult};
pub use models::{
    CacheInvalidation, ConflictOutcome, ConflictRecord, ConflictStrategy, EntityOrigin, JobIntent,
    LeaseGrant, LeaseRecord, Role, SyncEntity, SyncJob,
};
