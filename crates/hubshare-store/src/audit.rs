//! Append-only audit log.

use rusqlite::{params, Connection};

use crate::database::{parse_timestamp, Database};
use crate::error::Result;
use crate::models::{AuditAction, AuditEntry, AuditStatus};

/// Insert one entry on any connection or open transaction.
pub(crate) fn insert_audit(conn: &Connection, entry: &AuditEntry) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO audit_log (timestamp, acting_user, file_hash, action_type, status, details)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.timestamp.to_rfc3339(),
            entry.acting_user,
            entry.file_hash,
            entry.action_type.as_str(),
            entry.status.as_str(),
            entry.details,
        ],
    )?;
    Ok(())
}

impl Database {
    pub fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        insert_audit(self.conn(), entry)?;
        Ok(())
    }

    /// Entries for one file in insertion order.
    pub fn audit_for_file(&self, file_hash: &str) -> Result<Vec<AuditEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT timestamp, acting_user, file_hash, action_type, status, details
             FROM audit_log
             WHERE file_hash = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![file_hash], row_to_entry)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// The most recent `limit` entries across all files, newest first.
    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT timestamp, acting_user, file_hash, action_type, status, details
             FROM audit_log
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_entry)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let timestamp: String = row.get(0)?;
    let action: String = row.get(3)?;
    let status: String = row.get(4)?;

    let action_type = AuditAction::parse(&action).ok_or_else(|| unknown_enum(3, &action))?;
    let status = AuditStatus::parse(&status).ok_or_else(|| unknown_enum(4, &status))?;

    Ok(AuditEntry {
        timestamp: parse_timestamp(0, &timestamp)?,
        acting_user: row.get(1)?,
        file_hash: row.get(2)?,
        action_type,
        status,
        details: row.get(5)?,
    })
}

fn unknown_enum(idx: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unknown value {raw:?}").into(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_filter_by_file() {
        let db = Database::open_in_memory().unwrap();
        db.append_audit(&AuditEntry::new(
            Some("alice"),
            Some("h1"),
            AuditAction::FileShared,
            AuditStatus::Success,
            "shared with 2 users",
        ))
        .unwrap();
        db.append_audit(&AuditEntry::new(
            Some("bob"),
            Some("h2"),
            AuditAction::TokenRequested,
            AuditStatus::Denied,
            "",
        ))
        .unwrap();
        db.append_audit(&AuditEntry::new(
            Some("mallory"),
            None,
            AuditAction::Login,
            AuditStatus::Denied,
            "bad signature",
        ))
        .unwrap();

        let h1 = db.audit_for_file("h1").unwrap();
        assert_eq!(h1.len(), 1);
        assert_eq!(h1[0].action_type, AuditAction::FileShared);
        assert_eq!(h1[0].acting_user.as_deref(), Some("alice"));

        let recent = db.recent_audit(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].action_type, AuditAction::Login);
        assert_eq!(recent[0].file_hash, None);
    }
}
