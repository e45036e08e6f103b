//! Auditing envelope carried by every entity.
//!
//! # Invariants
//! - `created_*` are written once, on first persist, and never again.
//! - `modified_*` are written on insert and on every flushed update.
//! - Only the auditing interceptor mutates the envelope; callers read it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEnvelope {
    pub(crate) created_at: Option<DateTime<Utc>>,
    pub(crate) created_by: Option<String>,
    pub(crate) modified_at: Option<DateTime<Utc>>,
    pub(crate) modified_by: Option<String>,
}

impl AuditEnvelope {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn created_by(&self) -> Option<&str> {
        self.created_by.as_deref()
    }

    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.modified_at
    }

    pub fn modified_by(&self) -> Option<&str> {
        self.modified_by.as_deref()
    }
}
