//! Append-only revocation log. A row here denies access regardless of the
//! file's allow-list.

use rusqlite::{params, Connection};

use chrono::Utc;

use crate::database::{parse_timestamp, Database};
use crate::error::Result;
use crate::models::Revocation;

pub(crate) fn insert_revocation(
    conn: &Connection,
    file_hash: &str,
    revoked_user: &str,
    revoked_by: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO revocations (file_hash, revoked_user, revoked_by, timestamp)
         VALUES (?1, ?2, ?3, ?4)",
        params![file_hash, revoked_user, revoked_by, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

impl Database {
    pub fn is_revoked(&self, file_hash: &str, user: &str) -> Result<bool> {
        let revoked: bool = self.conn().query_row(
            "SELECT EXISTS(
                SELECT 1 FROM revocations WHERE file_hash = ?1 AND revoked_user = ?2
             )",
            params![file_hash, user],
            |row| row.get(0),
        )?;
        Ok(revoked)
    }

    pub fn revocations_for_file(&self, file_hash: &str) -> Result<Vec<Revocation>> {
        let mut stmt = self.conn().prepare(
            "SELECT file_hash, revoked_user, revoked_by, timestamp
             FROM revocations
             WHERE file_hash = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![file_hash], |row| {
            let ts: String = row.get(3)?;
            Ok(Revocation {
                file_hash: row.get(0)?,
                revoked_user: row.get(1)?,
                revoked_by: row.get(2)?,
                timestamp: parse_timestamp(3, &ts)?,
            })
        })?;

        let mut revocations = Vec::new();
        for row in rows {
            revocations.push(row?);
        }
        Ok(revocations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revocations_are_per_file() {
        let db = Database::open_in_memory().unwrap();
        insert_revocation(db.conn(), "h1", "carol", "alice").unwrap();

        assert!(db.is_revoked("h1", "carol").unwrap());
        assert!(!db.is_revoked("h2", "carol").unwrap());
        assert!(!db.is_revoked("h1", "bob").unwrap());

        let log = db.revocations_for_file("h1").unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].revoked_by, "alice");
    }
}
