//! File records and the composite mutations that must land atomically with
//! their audit entry.

use std::collections::BTreeMap;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::audit::insert_audit;
use crate::database::{parse_json, Database};
use crate::error::{Result, StoreError};
use crate::models::{AuditEntry, FileRecord};
use crate::revocations::insert_revocation;

const SELECT_FILE: &str = "SELECT file_hash, owner, file_name, size, iv, encrypted_keys,
        allowed_users, chunk_hashes, chunk_size
     FROM files";

fn load_file(conn: &Connection, file_hash: &str) -> Result<Option<FileRecord>> {
    let record = conn
        .query_row(
            &format!("{SELECT_FILE} WHERE file_hash = ?1"),
            params![file_hash],
            row_to_file,
        )
        .optional()?;
    Ok(record)
}

fn write_file(conn: &Connection, record: &FileRecord) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO files (file_hash, owner, file_name, size, iv, encrypted_keys,
                            allowed_users, chunk_hashes, chunk_size, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
         ON CONFLICT(file_hash) DO UPDATE SET
            owner = excluded.owner,
            file_name = excluded.file_name,
            size = excluded.size,
            iv = excluded.iv,
            encrypted_keys = excluded.encrypted_keys,
            allowed_users = excluded.allowed_users,
            chunk_hashes = excluded.chunk_hashes,
            chunk_size = excluded.chunk_size,
            updated_at = excluded.updated_at",
        params![
            record.file_hash,
            record.owner,
            record.file_name,
            record.size as i64,
            record.iv,
            serde_json::to_string(&record.encrypted_keys)?,
            serde_json::to_string(&record.allowed_users)?,
            serde_json::to_string(&record.chunk_hashes)?,
            record.chunk_size as i64,
            now,
        ],
    )?;
    Ok(())
}

impl Database {
    pub fn get_file(&self, file_hash: &str) -> Result<FileRecord> {
        self.find_file(file_hash)?
            .ok_or_else(|| StoreError::missing("file", file_hash))
    }

    pub fn find_file(&self, file_hash: &str) -> Result<Option<FileRecord>> {
        load_file(self.conn(), file_hash)
    }

    /// Insert or replace a record together with its audit entry.
    pub fn save_file(&mut self, record: &FileRecord, audit: &AuditEntry) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        write_file(&tx, record)?;
        insert_audit(&tx, audit)?;
        tx.commit()?;
        Ok(())
    }

    /// Append a revocation and drop `target` from both the allow-list and
    /// the wrapped key set, with the audit entry, in one transaction.
    pub fn apply_revocation(
        &mut self,
        file_hash: &str,
        target: &str,
        revoked_by: &str,
        audit: &AuditEntry,
    ) -> Result<FileRecord> {
        let tx = self.conn_mut().transaction()?;
        let mut record = load_file(&tx, file_hash)?
            .ok_or_else(|| StoreError::missing("file", file_hash))?;

        record.allowed_users.remove(target);
        record.encrypted_keys.remove(target);
        write_file(&tx, &record)?;
        insert_revocation(&tx, file_hash, target, revoked_by)?;
        insert_audit(&tx, audit)?;

        tx.commit()?;
        Ok(record)
    }

    /// Replace the IV and wrapped keys (and optionally the chunk hashes of
    /// the re-encrypted ciphertext) in one transaction.
    pub fn apply_rotation(
        &mut self,
        file_hash: &str,
        new_iv: &str,
        new_keys: &BTreeMap<String, String>,
        chunk_hashes: Option<&[String]>,
        audit: &AuditEntry,
    ) -> Result<FileRecord> {
        let tx = self.conn_mut().transaction()?;
        let mut record = load_file(&tx, file_hash)?
            .ok_or_else(|| StoreError::missing("file", file_hash))?;

        record.iv = new_iv.to_string();
        record.encrypted_keys = new_keys.clone();
        if let Some(hashes) = chunk_hashes {
            record.chunk_hashes = hashes.to_vec();
        }
        write_file(&tx, &record)?;
        insert_audit(&tx, audit)?;

        tx.commit()?;
        Ok(record)
    }
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
    let size: i64 = row.get(3)?;
    let keys: String = row.get(5)?;
    let allowed: String = row.get(6)?;
    let hashes: String = row.get(7)?;
    let chunk_size: i64 = row.get(8)?;

    Ok(FileRecord {
        file_hash: row.get(0)?,
        owner: row.get(1)?,
        file_name: row.get(2)?,
        size: size as u64,
        iv: row.get(4)?,
        encrypted_keys: parse_json(5, &keys)?,
        allowed_users: parse_json(6, &allowed)?,
        chunk_hashes: parse_json(7, &hashes)?,
        chunk_size: chunk_size as usize,
    })
}
