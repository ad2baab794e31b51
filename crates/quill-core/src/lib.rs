//! Quill Core - script lock coordination
//!
//! This crate provides:
//! - The per-script lock coordinator and its state machine
//! - Heartbeat scheduling for held locks
//! - The process-wide coordinator registry (one coordinator per script)
//! - The save-time ownership gate for the content-write path

pub mod model;
pub mod service;

// Re-export commonly used types
pub use model::{LockState, LockStatus, RemoteHolder};
pub use service::coordinator::{CoordinatorConfig, LockCoordinator, LockHandle};
pub use service::heartbeat::DEFAULT_HEARTBEAT_INTERVAL;
pub use service::registry::{LockLease, LockRegistry};
pub use service::verifier::SaveGate;
