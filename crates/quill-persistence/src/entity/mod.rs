//! Database entities

pub mod script_lock;
