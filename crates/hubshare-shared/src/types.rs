use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ShareError;

/// Persisted descriptor of a shared file's crypto and access metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub file_hash: String,
    pub owner: String,
    pub file_name: String,
    pub size: u64,
    /// Base64 AES-CBC IV of the current ciphertext
    pub iv: String,
    /// nickname -> base64 RSA-OAEP wrapped AES key
    pub encrypted_keys: BTreeMap<String, String>,
    pub allowed_users: BTreeSet<String>,
    pub chunk_hashes: Vec<String>,
    pub chunk_size: usize,
}

impl FileRecord {
    /// Every wrapped key must belong to someone on the allow-list.
    pub fn keys_within_allow_list(&self) -> bool {
        keys_subset(&self.encrypted_keys, &self.allowed_users)
    }
}

pub fn keys_subset(keys: &BTreeMap<String, String>, allowed: &BTreeSet<String>) -> bool {
    keys.keys().all(|user| allowed.contains(user))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Login,
    FileShared,
    TokenRequested,
    TokenIssued,
    AccessRevoked,
    KeyRotated,
    DownloadComplete,
    KeyRequested,
    TokenValidated,
    AuditLogRead,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Login => "LOGIN",
            AuditAction::FileShared => "FILE_SHARED",
            AuditAction::TokenRequested => "TOKEN_REQUESTED",
            AuditAction::TokenIssued => "TOKEN_ISSUED",
            AuditAction::AccessRevoked => "ACCESS_REVOKED",
            AuditAction::KeyRotated => "KEY_ROTATED",
            AuditAction::DownloadComplete => "DOWNLOAD_COMPLETE",
            AuditAction::KeyRequested => "KEY_REQUESTED",
            AuditAction::TokenValidated => "TOKEN_VALIDATED",
            AuditAction::AuditLogRead => "AUDIT_LOG_READ",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "LOGIN" => AuditAction::Login,
            "FILE_SHARED" => AuditAction::FileShared,
            "TOKEN_REQUESTED" => AuditAction::TokenRequested,
            "TOKEN_ISSUED" => AuditAction::TokenIssued,
            "ACCESS_REVOKED" => AuditAction::AccessRevoked,
            "KEY_ROTATED" => AuditAction::KeyRotated,
            "DOWNLOAD_COMPLETE" => AuditAction::DownloadComplete,
            "KEY_REQUESTED" => AuditAction::KeyRequested,
            "TOKEN_VALIDATED" => AuditAction::TokenValidated,
            "AUDIT_LOG_READ" => AuditAction::AuditLogRead,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Success,
    Denied,
    Failed,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Success => "SUCCESS",
            AuditStatus::Denied => "DENIED",
            AuditStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(AuditStatus::Success),
            "DENIED" => Some(AuditStatus::Denied),
            "FAILED" => Some(AuditStatus::Failed),
            _ => None,
        }
    }
}

/// One immutable row of the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub acting_user: Option<String>,
    pub file_hash: Option<String>,
    pub action_type: AuditAction,
    pub status: AuditStatus,
    pub details: String,
}

impl AuditEntry {
    pub fn new(
        acting_user: Option<&str>,
        file_hash: Option<&str>,
        action_type: AuditAction,
        status: AuditStatus,
        details: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            acting_user: acting_user.map(str::to_string),
            file_hash: file_hash.map(str::to_string),
            action_type,
            status,
            details: details.into(),
        }
    }
}

/// Short-lived capability bound to one (file, downloader) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadToken {
    pub token: String,
    pub file_hash: String,
    pub downloader: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DownloadToken {
    pub fn new(file_hash: &str, downloader: &str, ttl: Duration) -> Self {
        let issued_at = Utc::now();
        Self {
            token: random_token(),
            file_hash: file_hash.to_string(),
            downloader: downloader.to_string(),
            issued_at,
            expires_at: issued_at + ttl,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Expiry first, then file binding.
    pub fn check(&self, file_hash: &str, now: DateTime<Utc>) -> Result<(), ShareError> {
        if self.is_expired_at(now) {
            return Err(ShareError::TokenExpired);
        }
        if self.file_hash != file_hash {
            return Err(ShareError::TokenFileMismatch);
        }
        Ok(())
    }
}

// 128 bits from the OS RNG, hex encoded
fn random_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// A registered peer as listed by the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub nickname: String,
    pub public_key: String,
    pub online: bool,
    #[serde(default)]
    pub transfer_addr: Option<String>,
}

/// An entry of a peer's advertised file index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub file_name: String,
    pub file_hash: String,
    pub size: u64,
}
