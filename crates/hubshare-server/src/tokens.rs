//! Download token issuance and validation.
//!
//! Tokens live in memory only, keyed by their value. They are bound to one
//! (file, downloader) pair and never renewed; a new request mints a new
//! token. Expired entries are dropped by [`TokenIssuer::purge_expired`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use hubshare_shared::types::{AuditAction, AuditEntry, AuditStatus, DownloadToken};
use hubshare_shared::ShareError;

use crate::audit::status_for;
use crate::error::{HubError, HubResult};
use crate::registry::Registry;

#[derive(Clone)]
pub struct TokenIssuer {
    registry: Registry,
    tokens: Arc<RwLock<HashMap<String, DownloadToken>>>,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(registry: Registry, ttl: Duration) -> Self {
        Self {
            registry,
            tokens: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Mint a token for `requester` on a file it was just authorized for
    /// (see [`Registry::authorize_download`]).
    pub async fn mint(&self, file_hash: &str, requester: &str) -> HubResult<DownloadToken> {
        let token = DownloadToken::new(file_hash, requester, self.ttl);
        self.tokens
            .write()
            .await
            .insert(token.token.clone(), token.clone());

        self.registry
            .audit(AuditEntry::new(
                Some(requester),
                Some(file_hash),
                AuditAction::TokenIssued,
                AuditStatus::Success,
                format!("expires {}", token.expires_at.to_rfc3339()),
            ))
            .await?;

        Ok(token)
    }

    /// Record that no token reached `requester`, and hand `err` back.
    pub async fn refuse(&self, file_hash: &str, requester: &str, err: HubError) -> HubError {
        let entry = AuditEntry::new(
            Some(requester),
            Some(file_hash),
            AuditAction::TokenIssued,
            status_for(&err),
            err.to_string(),
        );
        if let Err(audit_err) = self.registry.audit(entry).await {
            tracing::error!(error = %audit_err, "failed to write audit entry");
        }
        err
    }

    /// Check a presented token against the file it is being used for.
    pub async fn validate(&self, token: &str, file_hash: &str) -> Result<DownloadToken, ShareError> {
        let found = self
            .tokens
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or(ShareError::TokenNotFound)?;

        match found.check(file_hash, Utc::now()) {
            Ok(()) => Ok(found),
            Err(ShareError::TokenExpired) => {
                self.tokens.write().await.remove(token);
                Err(ShareError::TokenExpired)
            }
            Err(e) => Err(e),
        }
    }

    /// Validation on behalf of the file's owner, who is about to serve
    /// bytes against the token. Audited.
    pub async fn validate_for_owner(
        &self,
        owner: &str,
        token: &str,
        file_hash: &str,
    ) -> HubResult<DownloadToken> {
        let outcome = match self.registry.get_file(file_hash).await {
            Ok(record) if record.owner != owner => Err(HubError::Share(ShareError::NotOwner)),
            Ok(_) => self.validate(token, file_hash).await.map_err(HubError::from),
            Err(e) => Err(e),
        };

        let (status, details) = match &outcome {
            Ok(t) => (AuditStatus::Success, format!("for {}", t.downloader)),
            Err(e) => (status_for(e), e.to_string()),
        };
        self.registry
            .audit(AuditEntry::new(
                Some(owner),
                Some(file_hash),
                AuditAction::TokenValidated,
                status,
                details,
            ))
            .await?;

        outcome
    }

    /// Drop every outstanding token `user` holds for `file_hash`.
    pub async fn revoke_for(&self, file_hash: &str, user: &str) -> usize {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, t| !(t.file_hash == file_hash && t.downloader == user));
        before - tokens.len()
    }

    /// Forget a single token.
    pub async fn discard(&self, token: &str) {
        self.tokens.write().await.remove(token);
    }

    /// Remove expired tokens. Returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, t| !t.is_expired_at(now));
        let removed = before - tokens.len();
        if removed > 0 {
            debug!(removed, remaining = tokens.len(), "Purged expired download tokens");
        }
        removed
    }

    pub async fn outstanding(&self) -> usize {
        self.tokens.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubshare_shared::chunks::sha256_hex;
    use hubshare_shared::crypto::SessionKey;
    use hubshare_shared::types::FileRecord;
    use hubshare_store::Database;
    use tokio::sync::Mutex;

    fn file_hash() -> String {
        sha256_hex(b"blob")
    }

    async fn issue(
        registry: &Registry,
        issuer: &TokenIssuer,
        user: &str,
    ) -> HubResult<DownloadToken> {
        registry.authorize_download(&file_hash(), user).await?;
        issuer.mint(&file_hash(), user).await
    }

    async fn setup(ttl: Duration) -> (Registry, TokenIssuer) {
        let registry = Registry::new(Arc::new(Mutex::new(Database::open_in_memory().unwrap())));
        let record = FileRecord {
            file_hash: file_hash(),
            owner: String::new(),
            file_name: "blob.bin".into(),
            size: 4,
            iv: SessionKey::generate().iv_base64(),
            encrypted_keys: [("bob".to_string(), "k".to_string())].into(),
            allowed_users: ["bob".to_string(), "carol".to_string()].into(),
            chunk_hashes: vec![],
            chunk_size: 4,
        };
        registry.share_file("alice", record).await.unwrap();
        let issuer = TokenIssuer::new(registry.clone(), ttl);
        (registry, issuer)
    }

    #[tokio::test]
    async fn issue_and_validate() {
        let (registry, issuer) = setup(Duration::seconds(300)).await;

        let token = issue(&registry, &issuer, "bob").await.unwrap();
        assert_eq!(token.downloader, "bob");

        let validated = issuer.validate(&token.token, &file_hash()).await.unwrap();
        assert_eq!(validated, token);
    }

    #[tokio::test]
    async fn validation_failures() {
        let (registry, issuer) = setup(Duration::seconds(300)).await;
        let token = issue(&registry, &issuer, "bob").await.unwrap();

        assert!(matches!(
            issuer.validate("deadbeef", &file_hash()).await,
            Err(ShareError::TokenNotFound)
        ));
        assert!(matches!(
            issuer.validate(&token.token, &sha256_hex(b"other")).await,
            Err(ShareError::TokenFileMismatch)
        ));
    }

    #[tokio::test]
    async fn expired_tokens_fail_and_are_purged() {
        let (registry, issuer) = setup(Duration::zero()).await;
        let token = issue(&registry, &issuer, "bob").await.unwrap();

        assert!(matches!(
            issuer.validate(&token.token, &file_hash()).await,
            Err(ShareError::TokenExpired)
        ));
        assert_eq!(issuer.outstanding().await, 0);

        issue(&registry, &issuer, "bob").await.unwrap();
        assert_eq!(issuer.purge_expired().await, 1);
    }

    #[tokio::test]
    async fn revoked_user_gets_no_token() {
        let (registry, issuer) = setup(Duration::seconds(300)).await;
        issue(&registry, &issuer, "carol").await.unwrap();

        registry.revoke("alice", &file_hash(), "carol").await.unwrap();
        assert_eq!(issuer.revoke_for(&file_hash(), "carol").await, 1);

        assert!(matches!(
            issue(&registry, &issuer, "carol").await,
            Err(HubError::Share(ShareError::AccessDenied))
        ));
        assert!(matches!(
            issue(&registry, &issuer, "mallory").await,
            Err(HubError::Share(ShareError::AccessDenied))
        ));
    }

    #[tokio::test]
    async fn only_owner_may_validate() {
        let (registry, issuer) = setup(Duration::seconds(300)).await;
        let token = issue(&registry, &issuer, "bob").await.unwrap();

        assert!(issuer
            .validate_for_owner("alice", &token.token, &file_hash())
            .await
            .is_ok());
        assert!(matches!(
            issuer.validate_for_owner("bob", &token.token, &file_hash()).await,
            Err(HubError::Share(ShareError::NotOwner))
        ));
    }

    #[tokio::test]
    async fn refusal_is_audited_without_a_token() {
        let (registry, issuer) = setup(Duration::seconds(300)).await;

        let err = issuer
            .refuse(&file_hash(), "bob", ShareError::Transport("owner away".into()).into())
            .await;
        assert!(matches!(err, HubError::Share(ShareError::Transport(_))));
        assert_eq!(issuer.outstanding().await, 0);

        let logs = registry.audit_log("alice", &file_hash()).await.unwrap();
        let issued: Vec<_> = logs
            .iter()
            .filter(|e| e.action_type == AuditAction::TokenIssued)
            .collect();
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].status, AuditStatus::Failed);
    }
}
