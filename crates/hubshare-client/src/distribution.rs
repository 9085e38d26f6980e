//! Key Distribution Manager.
//!
//! Encrypts a file once under a fresh AES-256 key, wraps that key for each
//! recipient's RSA public key and publishes the result through the hub.
//! After a revocation it rotates: new key, new IV, new ciphertext, keys
//! re-wrapped for whoever is left. A key is never reused across files or
//! across rotations. A rotated ciphertext only replaces the stored one once
//! the hub has taken the new keys.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use hubshare_shared::chunks::ChunkManifest;
use hubshare_shared::constants::MAX_FILE_SIZE;
use hubshare_shared::crypto::{self, SessionKey};
use hubshare_shared::identity::PeerKeys;
use hubshare_shared::types::UserSummary;
use hubshare_shared::ShareError;

use crate::hub_client::HubClient;
use crate::store::{CiphertextStore, ShareRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareReceipt {
    pub file_hash: String,
    pub file_name: String,
    /// Recipients a key was wrapped for
    pub recipients: BTreeSet<String>,
    /// Recipients skipped because the hub had no public key for them
    pub skipped: Vec<String>,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReceipt {
    pub file_hash: String,
    pub recipients: BTreeSet<String>,
    pub skipped: Vec<String>,
    /// SHA-256 of the new ciphertext
    pub content_hash: String,
}

/// Wrapped keys for every recipient we have a public key for.
fn wrap_for(
    key: &SessionKey,
    recipients: &BTreeSet<String>,
    users: &[UserSummary],
) -> Result<(BTreeMap<String, String>, Vec<String>), ShareError> {
    let directory: HashMap<&str, &str> = users
        .iter()
        .map(|u| (u.nickname.as_str(), u.public_key.as_str()))
        .collect();

    let mut wrapped = BTreeMap::new();
    let mut skipped = Vec::new();
    for recipient in recipients {
        match directory.get(recipient.as_str()) {
            Some(pem) => {
                wrapped.insert(recipient.clone(), crypto::wrap_key_for_recipient(pem, &key.key)?);
            }
            None => {
                warn!(user = %recipient, "No public key registered, skipping recipient");
                skipped.push(recipient.clone());
            }
        }
    }
    Ok((wrapped, skipped))
}

pub struct KeyDistributionManager {
    hub: Arc<HubClient>,
    keys: Arc<PeerKeys>,
    store: CiphertextStore,
    chunk_size: usize,
    /// Serializes rotations so two revocations never interleave their
    /// read-modify-write of a share record
    rotating: Mutex<()>,
}

impl KeyDistributionManager {
    pub fn new(hub: Arc<HubClient>, keys: Arc<PeerKeys>, store: CiphertextStore, chunk_size: usize) -> Self {
        Self {
            hub,
            keys,
            store,
            chunk_size,
            rotating: Mutex::new(()),
        }
    }

    /// Encrypt `path` for `recipients` and publish it. Recipients without
    /// a registered key are skipped, not fatal.
    pub async fn share_file(&self, path: &Path, recipients: &[&str]) -> Result<ShareReceipt, ShareError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ShareError::ValidationError(format!("no file name in {}", path.display())))?
            .to_string();
        let plaintext = tokio::fs::read(path).await?;
        if plaintext.len() as u64 > MAX_FILE_SIZE {
            return Err(ShareError::ValidationError("file too large".to_string()));
        }

        let me = self.hub.nickname();
        let wanted: BTreeSet<String> = recipients
            .iter()
            .filter(|r| **r != me)
            .map(|r| r.to_string())
            .collect();

        let users = self.hub.users().await?;
        let session = SessionKey::generate();
        let (encrypted_keys, skipped) = wrap_for(&session, &wanted, &users)?;

        let ciphertext = session.encrypt(&plaintext);
        let manifest = ChunkManifest::from_bytes(&ciphertext, self.chunk_size);
        let file_hash = manifest.content_hash.clone();
        self.store.write(&file_hash, &ciphertext).await?;

        let allowed: BTreeSet<String> = encrypted_keys.keys().cloned().collect();
        self.hub
            .share_file(
                &file_hash,
                &file_name,
                manifest.file_size,
                session.iv_base64(),
                encrypted_keys,
                allowed.clone(),
                manifest.chunk_hashes.clone(),
                self.chunk_size,
            )
            .await?;

        let record = ShareRecord {
            source: path.to_path_buf(),
            file_name: file_name.clone(),
            recipients: allowed.clone(),
        };
        self.store.save_share(&file_hash, &record).await?;

        info!(
            file_hash = %file_hash,
            recipients = allowed.len(),
            skipped = skipped.len(),
            "Shared file"
        );

        Ok(ShareReceipt {
            file_hash,
            file_name,
            recipients: allowed,
            skipped,
            total_chunks: manifest.total_chunks(),
        })
    }

    /// Re-key a file after `revoked` lost access: fresh key and IV, new
    /// ciphertext in place of the old one, keys for the remaining
    /// recipients only.
    pub async fn rotate_after_revocation(
        &self,
        file_hash: &str,
        revoked: &str,
    ) -> Result<RotationReceipt, ShareError> {
        let _rotating = self.rotating.lock().await;
        let mut share = self.store.load_share(file_hash).await?;
        share.recipients.remove(revoked);

        let plaintext = tokio::fs::read(&share.source).await?;
        let users = self.hub.users().await?;
        let session = SessionKey::generate();
        let (encrypted_keys, skipped) = wrap_for(&session, &share.recipients, &users)?;

        let ciphertext = session.encrypt(&plaintext);
        let manifest = ChunkManifest::from_bytes(&ciphertext, self.chunk_size);
        let staged = self.store.stage(file_hash, &ciphertext).await?;

        let recipients: BTreeSet<String> = encrypted_keys.keys().cloned().collect();
        self.hub
            .update_file_keys(
                file_hash,
                session.iv_base64(),
                encrypted_keys,
                Some(manifest.chunk_hashes),
            )
            .await?;
        staged.commit().await?;

        share.recipients = recipients.clone();
        self.store.save_share(file_hash, &share).await?;

        info!(
            file_hash,
            revoked,
            remaining = recipients.len(),
            "Rotated file key"
        );

        Ok(RotationReceipt {
            file_hash: file_hash.to_string(),
            recipients,
            skipped,
            content_hash: manifest.content_hash,
        })
    }

    /// Decrypt a downloaded ciphertext with the key the hub holds for us.
    pub async fn decrypt_received(
        &self,
        file_hash: &str,
        ciphertext_path: &Path,
        output: &Path,
    ) -> Result<PathBuf, ShareError> {
        let (encrypted_key, iv) = self.hub.file_key(file_hash).await?;
        let key = self.keys.unwrap_session_key(&encrypted_key)?;
        let iv = crypto::decode_iv(&iv)?;

        let ciphertext = tokio::fs::read(ciphertext_path).await?;
        let plaintext = crypto::aes_decrypt(&key, &iv, &ciphertext)?;

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output, plaintext).await?;
        Ok(output.to_path_buf())
    }
}
