//! Error types and error codes for Quill
//!
//! This module defines:
//! - `QuillError`: Application-specific error enum
//! - `ErrorCode`: Structured error codes for API responses

use serde::{Deserialize, Serialize};

/// Application-specific error types
#[derive(thiserror::Error, Debug)]
pub enum QuillError {
    #[error("script '{script_id}' is locked by {holder_name}")]
    AcquisitionDenied {
        script_id: String,
        holder_id: String,
        holder_name: String,
    },

    #[error("lock on script '{0}' is no longer held")]
    LockLost(String),

    #[error("lock store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("database error: {0}")]
    DatabaseError(String),
}

impl QuillError {
    /// Whether an error chain bottoms out in a lost lock.
    ///
    /// Edit-submission callers use this to distinguish the save gate's
    /// rejection from transport faults.
    pub fn is_lock_lost(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<QuillError>(), Some(QuillError::LockLost(_)))
    }
}

/// Error code structure for API responses
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ErrorCode<'a> {
    pub code: i32,
    pub message: &'a str,
}

pub const SUCCESS: ErrorCode<'static> = ErrorCode {
    code: 0,
    message: "success",
};

pub const ACCESS_DENIED: ErrorCode<'static> = ErrorCode {
    code: 10001,
    message: "access denied",
};

pub const DATA_ACCESS_ERROR: ErrorCode<'static> = ErrorCode {
    code: 10002,
    message: "data access error",
};

pub const SCRIPT_LOCKED: ErrorCode<'static> = ErrorCode {
    code: 24001,
    message: "script is locked by another session",
};

pub const LOCK_NOT_HELD: ErrorCode<'static> = ErrorCode {
    code: 24002,
    message: "lock no longer held",
};
