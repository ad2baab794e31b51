//! Persistence traits

mod lock;

pub use lock::LockPersistence;
