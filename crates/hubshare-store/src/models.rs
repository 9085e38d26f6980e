//! Row types owned by the store. File records and audit entries reuse the
//! shared domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use hubshare_shared::types::{AuditAction, AuditEntry, AuditStatus, FileRecord};

/// A registered peer identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub nickname: String,
    /// RSA public key, SPKI PEM.
    pub public_key: String,
    pub created_at: DateTime<Utc>,
    /// Last time the public key was (re-)registered.
    pub updated_at: DateTime<Utc>,
}

/// One durable denial of a user's access to a file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Revocation {
    pub file_hash: String,
    pub revoked_user: String,
    pub revoked_by: String,
    pub timestamp: DateTime<Utc>,
}
