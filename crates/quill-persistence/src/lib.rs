//! Quill Persistence - lock records and lock stores
//!
//! This crate provides:
//! - The lock record model and expiry predicate
//! - The `LockPersistence` storage contract
//! - A SQL store (MySQL/PostgreSQL via SeaORM) with row-locked mutations
//! - An in-memory store for single-process deployments and tests
//! - The change-event bus stores publish committed mutations on

pub mod entity;
pub mod events;
pub mod memory;
pub mod model;
pub mod sql;
pub mod traits;

// Re-export commonly used types
pub use events::{LockChangeEvent, LockChangeKind, LockEventBus};
pub use memory::MemoryLockService;
pub use model::{AcquireOutcome, DEFAULT_EXPIRY_THRESHOLD, LockRecord};
pub use sql::SqlLockService;
pub use traits::LockPersistence;
