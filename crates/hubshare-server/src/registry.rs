//! File registry and access controller.
//!
//! All reads and writes go through one database handle behind a mutex, so
//! conflicting mutations of the same record (a rotation racing a
//! revocation, for instance) are serialized. Access is granted only when
//! the user is on the allow-list *and* has no revocation for the file.

use std::collections::BTreeMap;

use hubshare_shared::constants::MAX_FILE_SIZE;
use hubshare_shared::crypto;
use hubshare_shared::types::{keys_subset, AuditAction, AuditEntry, AuditStatus, FileRecord};
use hubshare_shared::ShareError;
use hubshare_store::{Database, User};

use crate::audit::{self, SharedDb};
use crate::error::{HubError, HubResult};

#[derive(Clone)]
pub struct Registry {
    db: SharedDb,
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn invalid(msg: impl Into<String>) -> HubError {
    HubError::Share(ShareError::ValidationError(msg.into()))
}

fn load_record(db: &Database, file_hash: &str) -> HubResult<FileRecord> {
    db.find_file(file_hash)?
        .ok_or(HubError::Share(ShareError::FileNotFound))
}

fn require_owner(record: &FileRecord, caller: &str) -> HubResult<()> {
    if record.owner != caller {
        return Err(ShareError::NotOwner.into());
    }
    Ok(())
}

/// Both independent checks: allow-list membership and no revocation.
fn check_access(db: &Database, file_hash: &str, user: &str) -> HubResult<FileRecord> {
    let record = load_record(db, file_hash)?;
    if db.is_revoked(file_hash, user)? || !record.allowed_users.contains(user) {
        return Err(ShareError::AccessDenied.into());
    }
    Ok(record)
}

fn validate_share(record: &FileRecord) -> HubResult<()> {
    if !is_sha256_hex(&record.file_hash) {
        return Err(invalid("fileHash must be a lowercase hex SHA-256"));
    }
    if record.file_name.trim().is_empty() {
        return Err(invalid("fileName is empty"));
    }
    if record.size > MAX_FILE_SIZE {
        return Err(invalid(format!("file exceeds {MAX_FILE_SIZE} bytes")));
    }
    if record.chunk_size == 0 {
        return Err(invalid("chunkSize must be positive"));
    }
    if !record.chunk_hashes.iter().all(|h| is_sha256_hex(h)) {
        return Err(invalid("chunkHashes must be lowercase hex SHA-256"));
    }
    crypto::decode_iv(&record.iv).map_err(|e| invalid(format!("iv: {e}")))?;
    if !record.keys_within_allow_list() {
        return Err(invalid("encryptedKeys holds a user missing from allowedUsers"));
    }
    Ok(())
}

impl Registry {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Register a nickname or supersede its public key.
    pub async fn register_user(&self, nickname: &str, public_key: &str) -> HubResult<User> {
        crypto::parse_public_key(public_key).map_err(|e| invalid(e.to_string()))?;
        Ok(self.db.lock().await.upsert_user(nickname, public_key)?)
    }

    pub async fn list_users(&self) -> HubResult<Vec<User>> {
        Ok(self.db.lock().await.list_users()?)
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    pub async fn get_file(&self, file_hash: &str) -> HubResult<FileRecord> {
        load_record(&*self.db.lock().await, file_hash)
    }

    /// Create or re-publish a file record owned by `owner`.
    pub async fn share_file(&self, owner: &str, mut record: FileRecord) -> HubResult<FileRecord> {
        record.owner = owner.to_string();
        let file_hash = record.file_hash.clone();
        let mut db = self.db.lock().await;

        let checked = validate_share(&record).and_then(|()| match db.find_file(&file_hash)? {
            Some(existing) => require_owner(&existing, owner),
            None => Ok(()),
        });
        if let Err(e) = checked {
            return Err(audit::record_failure(
                &db,
                Some(owner),
                Some(&file_hash),
                AuditAction::FileShared,
                e,
            ));
        }

        let entry = AuditEntry::new(
            Some(owner),
            Some(&file_hash),
            AuditAction::FileShared,
            AuditStatus::Success,
            format!(
                "{} shared with {} recipient(s)",
                record.file_name,
                record.encrypted_keys.len()
            ),
        );
        db.save_file(&record, &entry)?;
        audit::trace_entry(&entry);
        Ok(record)
    }

    /// Owner-only. Appends a revocation and removes `target` from the
    /// allow-list and the wrapped key set. Audited whatever the outcome.
    pub async fn revoke(&self, owner: &str, file_hash: &str, target: &str) -> HubResult<FileRecord> {
        let mut db = self.db.lock().await;

        let checked = load_record(&db, file_hash).and_then(|record| {
            require_owner(&record, owner)?;
            if target == owner {
                return Err(invalid("an owner cannot revoke themselves"));
            }
            Ok(())
        });
        if let Err(e) = checked {
            return Err(audit::record_failure(
                &db,
                Some(owner),
                Some(file_hash),
                AuditAction::AccessRevoked,
                e,
            ));
        }

        let entry = AuditEntry::new(
            Some(owner),
            Some(file_hash),
            AuditAction::AccessRevoked,
            AuditStatus::Success,
            format!("revoked {target}"),
        );
        let record = db.apply_revocation(file_hash, target, owner, &entry)?;
        audit::trace_entry(&entry);
        Ok(record)
    }

    /// Owner-only. Replaces the IV and wrapped keys in a single transaction.
    pub async fn rotate_keys(
        &self,
        owner: &str,
        file_hash: &str,
        new_iv: &str,
        new_keys: &BTreeMap<String, String>,
        chunk_hashes: Option<&[String]>,
    ) -> HubResult<FileRecord> {
        let mut db = self.db.lock().await;

        let checked = load_record(&db, file_hash).and_then(|record| {
            require_owner(&record, owner)?;
            crypto::decode_iv(new_iv).map_err(|e| invalid(format!("newIV: {e}")))?;
            if !keys_subset(new_keys, &record.allowed_users) {
                return Err(invalid("newEncryptedKeys holds a user missing from allowedUsers"));
            }
            for user in new_keys.keys() {
                if db.is_revoked(file_hash, user)? {
                    return Err(invalid(format!("{user} is revoked for this file")));
                }
            }
            if let Some(hashes) = chunk_hashes {
                if !hashes.iter().all(|h| is_sha256_hex(h)) {
                    return Err(invalid("chunkHashes must be lowercase hex SHA-256"));
                }
            }
            Ok(())
        });
        if let Err(e) = checked {
            return Err(audit::record_failure(
                &db,
                Some(owner),
                Some(file_hash),
                AuditAction::KeyRotated,
                e,
            ));
        }

        let entry = AuditEntry::new(
            Some(owner),
            Some(file_hash),
            AuditAction::KeyRotated,
            AuditStatus::Success,
            format!("rotated for {} recipient(s)", new_keys.len()),
        );
        let record = db.apply_rotation(file_hash, new_iv, new_keys, chunk_hashes, &entry)?;
        audit::trace_entry(&entry);
        Ok(record)
    }

    /// The requester's wrapped key and the current IV.
    pub async fn get_key_for(&self, file_hash: &str, requester: &str) -> HubResult<(String, String)> {
        let db = self.db.lock().await;

        let outcome = check_access(&db, file_hash, requester).and_then(|record| {
            let key = record
                .encrypted_keys
                .get(requester)
                .cloned()
                .ok_or(HubError::Share(ShareError::AccessDenied))?;
            Ok((key, record.iv))
        });

        match outcome {
            Ok(found) => {
                audit::persist(
                    &db,
                    &AuditEntry::new(
                        Some(requester),
                        Some(file_hash),
                        AuditAction::KeyRequested,
                        AuditStatus::Success,
                        "",
                    ),
                )?;
                Ok(found)
            }
            Err(e) => Err(audit::record_failure(
                &db,
                Some(requester),
                Some(file_hash),
                AuditAction::KeyRequested,
                e,
            )),
        }
    }

    /// Fresh access check for a download token request. Always re-reads the
    /// allow-list and revocation log.
    pub async fn authorize_download(&self, file_hash: &str, requester: &str) -> HubResult<FileRecord> {
        self.checked_access(file_hash, requester, AuditAction::TokenRequested)
            .await
    }

    /// A downloader reports a finished transfer.
    pub async fn record_download(&self, file_hash: &str, user: &str) -> HubResult<()> {
        self.checked_access(file_hash, user, AuditAction::DownloadComplete)
            .await
            .map(|_| ())
    }

    async fn checked_access(
        &self,
        file_hash: &str,
        user: &str,
        action: AuditAction,
    ) -> HubResult<FileRecord> {
        let db = self.db.lock().await;
        match check_access(&db, file_hash, user) {
            Ok(record) => {
                audit::persist(
                    &db,
                    &AuditEntry::new(Some(user), Some(file_hash), action, AuditStatus::Success, ""),
                )?;
                Ok(record)
            }
            Err(e) => Err(audit::record_failure(&db, Some(user), Some(file_hash), action, e)),
        }
    }

    /// Append an entry outside of any other operation.
    pub async fn audit(&self, entry: AuditEntry) -> HubResult<()> {
        audit::persist(&*self.db.lock().await, &entry)
    }

    /// Owner-only view of a file's audit trail.
    pub async fn audit_log(&self, requester: &str, file_hash: &str) -> HubResult<Vec<AuditEntry>> {
        let db = self.db.lock().await;

        let checked = load_record(&db, file_hash).and_then(|record| require_owner(&record, requester));
        if let Err(e) = checked {
            return Err(audit::record_failure(
                &db,
                Some(requester),
                Some(file_hash),
                AuditAction::AuditLogRead,
                e,
            ));
        }

        let logs = db.audit_for_file(file_hash)?;
        audit::persist(
            &db,
            &AuditEntry::new(
                Some(requester),
                Some(file_hash),
                AuditAction::AuditLogRead,
                AuditStatus::Success,
                format!("{} entries", logs.len()),
            ),
        )?;
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use tokio::sync::Mutex;

    use super::*;
    use hubshare_shared::chunks::sha256_hex;
    use hubshare_shared::crypto::SessionKey;

    fn registry() -> Registry {
        Registry::new(Arc::new(Mutex::new(Database::open_in_memory().unwrap())))
    }

    fn file_hash() -> String {
        sha256_hex(b"ciphertext")
    }

    fn record(recipients: &[&str]) -> FileRecord {
        FileRecord {
            file_hash: file_hash(),
            owner: String::new(),
            file_name: "plans.txt".into(),
            size: 42,
            iv: SessionKey::generate().iv_base64(),
            encrypted_keys: recipients
                .iter()
                .map(|u| (u.to_string(), format!("wrapped-for-{u}")))
                .collect(),
            allowed_users: recipients.iter().map(|u| u.to_string()).collect(),
            chunk_hashes: vec![sha256_hex(b"c0")],
            chunk_size: 64 * 1024,
        }
    }

    async fn audit_actions(reg: &Registry) -> Vec<(AuditAction, AuditStatus)> {
        reg.db
            .lock()
            .await
            .audit_for_file(&file_hash())
            .unwrap()
            .into_iter()
            .map(|e| (e.action_type, e.status))
            .collect()
    }

    #[tokio::test]
    async fn share_and_fetch_key() {
        let reg = registry();
        let shared = reg.share_file("alice", record(&["bob", "carol"])).await.unwrap();
        assert_eq!(shared.owner, "alice");

        let (key, iv) = reg.get_key_for(&file_hash(), "bob").await.unwrap();
        assert_eq!(key, "wrapped-for-bob");
        assert_eq!(iv, shared.iv);

        assert!(matches!(
            reg.get_key_for(&file_hash(), "mallory").await,
            Err(HubError::Share(ShareError::AccessDenied))
        ));
    }

    #[tokio::test]
    async fn share_rejects_keys_outside_allow_list() {
        let reg = registry();
        let mut rec = record(&["bob"]);
        rec.allowed_users = BTreeSet::new();

        let err = reg.share_file("alice", rec).await.unwrap_err();
        assert!(matches!(err, HubError::Share(ShareError::ValidationError(_))));
        assert_eq!(
            audit_actions(&reg).await,
            vec![(AuditAction::FileShared, AuditStatus::Failed)]
        );
    }

    #[tokio::test]
    async fn share_rejects_bad_hash_and_iv() {
        let reg = registry();
        let mut rec = record(&["bob"]);
        rec.file_hash = "../../etc/passwd".into();
        assert!(reg.share_file("alice", rec).await.is_err());

        let mut rec = record(&["bob"]);
        rec.iv = "AAAA".into();
        assert!(reg.share_file("alice", rec).await.is_err());
    }

    #[tokio::test]
    async fn reshare_by_other_user_is_not_owner() {
        let reg = registry();
        reg.share_file("alice", record(&["bob"])).await.unwrap();

        let err = reg.share_file("mallory", record(&["mallory"])).await.unwrap_err();
        assert!(matches!(err, HubError::Share(ShareError::NotOwner)));
        assert_eq!(reg.get_file(&file_hash()).await.unwrap().owner, "alice");
    }

    #[tokio::test]
    async fn revoke_is_owner_only_and_always_audited() {
        let reg = registry();
        reg.share_file("alice", record(&["bob", "carol"])).await.unwrap();

        let err = reg.revoke("bob", &file_hash(), "carol").await.unwrap_err();
        assert!(matches!(err, HubError::Share(ShareError::NotOwner)));

        let updated = reg.revoke("alice", &file_hash(), "carol").await.unwrap();
        assert!(!updated.allowed_users.contains("carol"));
        assert!(updated.keys_within_allow_list());

        assert_eq!(
            audit_actions(&reg).await,
            vec![
                (AuditAction::FileShared, AuditStatus::Success),
                (AuditAction::AccessRevoked, AuditStatus::Denied),
                (AuditAction::AccessRevoked, AuditStatus::Success),
            ]
        );
    }

    #[tokio::test]
    async fn revocation_dominates_stale_allow_list() {
        let reg = registry();
        reg.share_file("alice", record(&["bob", "carol"])).await.unwrap();
        reg.revoke("alice", &file_hash(), "carol").await.unwrap();

        // Owner re-publishes with carol back on the allow-list.
        reg.share_file("alice", record(&["bob", "carol"])).await.unwrap();

        assert!(matches!(
            reg.authorize_download(&file_hash(), "carol").await,
            Err(HubError::Share(ShareError::AccessDenied))
        ));
        assert!(matches!(
            reg.get_key_for(&file_hash(), "carol").await,
            Err(HubError::Share(ShareError::AccessDenied))
        ));
        assert!(reg.authorize_download(&file_hash(), "bob").await.is_ok());
    }

    #[tokio::test]
    async fn rotation_replaces_keys_atomically() {
        let reg = registry();
        let original = reg.share_file("alice", record(&["bob", "carol"])).await.unwrap();
        reg.revoke("alice", &file_hash(), "carol").await.unwrap();

        let new_iv = SessionKey::generate().iv_base64();
        let keys = BTreeMap::from([("bob".to_string(), "bob-v2".to_string())]);
        let rotated = reg
            .rotate_keys("alice", &file_hash(), &new_iv, &keys, None)
            .await
            .unwrap();

        assert_eq!(rotated.iv, new_iv);
        assert_ne!(rotated.iv, original.iv);
        assert_eq!(rotated.encrypted_keys, keys);
        assert_eq!(
            reg.get_key_for(&file_hash(), "bob").await.unwrap(),
            ("bob-v2".to_string(), new_iv)
        );
    }

    #[tokio::test]
    async fn rotation_cannot_hand_keys_to_revoked_user() {
        let reg = registry();
        let original = reg.share_file("alice", record(&["bob", "carol"])).await.unwrap();
        reg.revoke("alice", &file_hash(), "carol").await.unwrap();

        let keys = BTreeMap::from([
            ("bob".to_string(), "bob-v2".to_string()),
            ("carol".to_string(), "carol-v2".to_string()),
        ]);
        let err = reg
            .rotate_keys("alice", &file_hash(), &SessionKey::generate().iv_base64(), &keys, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Share(ShareError::ValidationError(_))));

        // nothing persisted
        let current = reg.get_file(&file_hash()).await.unwrap();
        assert_eq!(current.iv, original.iv);
        assert!(current.keys_within_allow_list());
    }

    #[tokio::test]
    async fn rotation_by_non_owner() {
        let reg = registry();
        reg.share_file("alice", record(&["bob"])).await.unwrap();
        let err = reg
            .rotate_keys(
                "bob",
                &file_hash(),
                &SessionKey::generate().iv_base64(),
                &BTreeMap::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Share(ShareError::NotOwner)));
    }

    #[tokio::test]
    async fn audit_log_is_owner_only() {
        let reg = registry();
        reg.share_file("alice", record(&["bob"])).await.unwrap();

        assert!(matches!(
            reg.audit_log("bob", &file_hash()).await,
            Err(HubError::Share(ShareError::NotOwner))
        ));
        let logs = reg.audit_log("alice", &file_hash()).await.unwrap();
        assert_eq!(logs[0].action_type, AuditAction::FileShared);
        assert_eq!(logs[1].status, AuditStatus::Denied);
    }

    #[tokio::test]
    async fn unknown_file() {
        let reg = registry();
        assert!(matches!(
            reg.authorize_download(&file_hash(), "bob").await,
            Err(HubError::Share(ShareError::FileNotFound))
        ));
    }

    #[tokio::test]
    async fn register_requires_pem() {
        let reg = registry();
        assert!(reg.register_user("alice", "hello").await.is_err());
    }
}
