//! JSON wire protocols. Every message is an object with a `type`
//! discriminator; each direction of each protocol is one closed enum.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::CHUNK_SIZE;
use crate::error::ShareError;
use crate::types::{AuditEntry, IndexEntry, UserSummary};

fn default_chunk_size() -> usize {
    CHUNK_SIZE
}

/// Peer -> hub requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HubRequest {
    RegisterKey {
        from: String,
        public_key: String,
        /// Address other peers should dial to reach our uploader
        #[serde(default)]
        transfer_addr: Option<String>,
    },
    FileIndex {
        files: Vec<IndexEntry>,
    },
    GetUsers,
    ShareFile {
        file_hash: String,
        file_name: String,
        size: u64,
        iv: String,
        encrypted_keys: BTreeMap<String, String>,
        allowed_users: BTreeSet<String>,
        #[serde(default)]
        chunk_hashes: Vec<String>,
        #[serde(default = "default_chunk_size")]
        chunk_size: usize,
    },
    GetFileKey {
        file_hash: String,
    },
    RequestDownloadToken {
        file_hash: String,
        #[serde(default)]
        uploader: Option<String>,
    },
    RevokeAccess {
        file_hash: String,
        target_user: String,
    },
    UpdateFileKeys {
        file_hash: String,
        #[serde(rename = "newIV")]
        new_iv: String,
        new_encrypted_keys: BTreeMap<String, String>,
        #[serde(default)]
        chunk_hashes: Option<Vec<String>>,
    },
    #[serde(rename = "get_audit_log")]
    GetAuditLog {
        file_hash: String,
    },
    DownloadComplete {
        file_hash: String,
    },
    ValidateToken {
        file_hash: String,
        token: String,
    },
}

/// Hub -> peer responses and notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HubEvent {
    Welcome {
        nickname: String,
    },
    KeyAck {
        nickname: String,
    },
    IndexAck {
        count: usize,
    },
    UserList {
        users: Vec<UserSummary>,
    },
    ShareAck {
        file_hash: String,
    },
    FileShared {
        from: String,
        file_hash: String,
        file_name: String,
        size: u64,
        encrypted_key: String,
        iv: String,
    },
    FileKey {
        file_hash: String,
        encrypted_key: String,
        iv: String,
    },
    DownloadToken {
        token: String,
        file_hash: String,
        uploader: String,
        #[serde(default)]
        uploader_addr: Option<String>,
        expires_at: DateTime<Utc>,
    },
    DownloadTokenIssued {
        token: String,
        file_hash: String,
        downloader: String,
        expires_at: DateTime<Utc>,
    },
    RevocationConfirmed {
        file_hash: String,
        revoked_user: String,
    },
    RevokedNotice {
        file_hash: String,
        by: String,
    },
    KeysUpdated {
        file_hash: String,
    },
    KeyUpdateNotice {
        file_hash: String,
        by: String,
    },
    AuditLog {
        file_hash: String,
        logs: Vec<AuditEntry>,
    },
    DownloadRecorded {
        file_hash: String,
    },
    TokenValid {
        token: String,
        file_hash: String,
        downloader: String,
        expires_at: DateTime<Utc>,
    },
    Error {
        text: String,
        #[serde(default)]
        code: Option<String>,
    },
}

impl HubEvent {
    pub fn error(err: &ShareError) -> Self {
        HubEvent::Error {
            text: err.to_string(),
            code: Some(err.code().to_string()),
        }
    }

    /// Unsolicited events pushed by the hub, as opposed to the reply to
    /// the request a peer has in flight.
    pub fn is_notification(&self) -> bool {
        matches!(
            self,
            HubEvent::Welcome { .. }
                | HubEvent::FileShared { .. }
                | HubEvent::DownloadTokenIssued { .. }
                | HubEvent::RevokedNotice { .. }
                | HubEvent::KeyUpdateNotice { .. }
        )
    }
}

/// Downloader -> uploader requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PeerRequest {
    DownloadRequest {
        file_hash: String,
        token: String,
        #[serde(default)]
        start_offset: u64,
    },
    RequestChunk {
        file_hash: String,
        token: String,
        chunk_index: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_hash: String,
    pub total_chunks: u32,
    pub file_size: u64,
    pub expected_chunk_hashes: Vec<String>,
    pub start_chunk_index: u32,
    pub chunk_size: usize,
    /// SHA-256 of the whole ciphertext being served
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub current: u32,
    pub total: u32,
    /// Base64 chunk bytes
    pub chunk: String,
    pub hash: String,
}

/// Uploader -> downloader events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PeerEvent {
    FileMetadata(FileMetadata),
    FileChunk(FileChunk),
    FileComplete {
        file_hash: String,
    },
    Error {
        text: String,
        #[serde(default)]
        code: Option<String>,
    },
}

impl PeerEvent {
    pub fn error(err: &ShareError) -> Self {
        PeerEvent::Error {
            text: err.to_string(),
            code: Some(err.code().to_string()),
        }
    }
}

macro_rules! json_codec {
    ($($ty:ty),*) => {$(
        impl $ty {
            pub fn to_json(&self) -> Result<String, serde_json::Error> {
                serde_json::to_string(self)
            }

            pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
                serde_json::from_str(text)
            }
        }
    )*};
}

json_codec!(HubRequest, HubEvent, PeerRequest, PeerEvent);
