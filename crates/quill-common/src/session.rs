//! Editing-session identity
//!
//! The identity provider hands the lock subsystem an opaque holder id
//! and a display name; nothing here validates or provisions identities.

use serde::{Deserialize, Serialize};

/// Identity of one editing session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditSession {
    /// Opaque holder id, stable for the lifetime of the session.
    pub holder_id: String,
    /// Display name shown to other sessions contending for the lock.
    pub holder_name: String,
    /// Administrative capability; gates force-unlock.
    #[serde(default)]
    pub admin: bool,
}

impl EditSession {
    pub fn new(holder_id: impl Into<String>, holder_name: impl Into<String>) -> Self {
        Self {
            holder_id: holder_id.into(),
            holder_name: holder_name.into(),
            admin: false,
        }
    }

    pub fn admin(holder_id: impl Into<String>, holder_name: impl Into<String>) -> Self {
        Self {
            holder_id: holder_id.into(),
            holder_name: holder_name.into(),
            admin: true,
        }
    }

    /// Session with a freshly generated holder id.
    pub fn generate(holder_name: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), holder_name)
    }
}
