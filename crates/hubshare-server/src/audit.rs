//! Audit trail helpers. Every security decision is persisted and mirrored
//! to the tracing output: grants at `info`, denials and failures at `warn`.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use hubshare_shared::types::{AuditAction, AuditEntry, AuditStatus};
use hubshare_store::Database;

use crate::error::{HubError, HubResult};

pub type SharedDb = Arc<Mutex<Database>>;

/// Emit the tracing line for an entry that has been (or is about to be)
/// persisted.
pub fn trace_entry(entry: &AuditEntry) {
    let user = entry.acting_user.as_deref().unwrap_or("-");
    let file_hash = entry.file_hash.as_deref().unwrap_or("-");
    match entry.status {
        AuditStatus::Success => info!(
            action = entry.action_type.as_str(),
            user,
            file_hash,
            details = %entry.details,
            "audit"
        ),
        AuditStatus::Denied | AuditStatus::Failed => warn!(
            action = entry.action_type.as_str(),
            status = entry.status.as_str(),
            user,
            file_hash,
            details = %entry.details,
            "audit"
        ),
    }
}

/// Audit status an error maps to.
pub fn status_for(err: &HubError) -> AuditStatus {
    match err.share() {
        Some(e) if e.is_security_decision() => AuditStatus::Denied,
        _ => AuditStatus::Failed,
    }
}

/// Persist a standalone entry on an already locked database.
pub fn persist(db: &Database, entry: &AuditEntry) -> HubResult<()> {
    trace_entry(entry);
    db.append_audit(entry)?;
    Ok(())
}

/// Record the failure of `action` and hand the error back to the caller.
/// A failure to write the audit row is logged but never masks `err`.
pub fn record_failure(
    db: &Database,
    actor: Option<&str>,
    file_hash: Option<&str>,
    action: AuditAction,
    err: HubError,
) -> HubError {
    let entry = AuditEntry::new(actor, file_hash, action, status_for(&err), err.to_string());
    if let Err(audit_err) = persist(db, &entry) {
        tracing::error!(error = %audit_err, "failed to write audit entry");
    }
    err
}

/// Owner of the shared database handle for callers outside the registry
/// (connection-level events such as logins).
#[derive(Clone)]
pub struct AuditLog {
    db: SharedDb,
}

impl AuditLog {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }

    pub async fn record(&self, entry: AuditEntry) -> HubResult<()> {
        let db = self.db.lock().await;
        persist(&db, &entry)
    }

    pub async fn login(&self, nickname: Option<&str>, status: AuditStatus, details: impl Into<String>) {
        let entry = AuditEntry::new(nickname, None, AuditAction::Login, status, details);
        if let Err(e) = self.record(entry).await {
            tracing::error!(error = %e, "failed to write login audit entry");
        }
    }

    pub async fn recent(&self, limit: usize) -> HubResult<Vec<AuditEntry>> {
        Ok(self.db.lock().await.recent_audit(limit)?)
    }
}
