//! v001 -- Initial schema creation.
//!
//! Creates the four hub tables: `users`, `files`, `revocations` and
//! `audit_log`. The last two are append-only.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    nickname     TEXT PRIMARY KEY NOT NULL,
    public_key   TEXT NOT NULL,               -- SPKI PEM, superseded on re-registration
    created_at   TEXT NOT NULL,               -- RFC-3339
    updated_at   TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Files, keyed by the ciphertext hash at share time
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS files (
    file_hash      TEXT PRIMARY KEY NOT NULL,
    owner          TEXT NOT NULL,
    file_name      TEXT NOT NULL,
    size           INTEGER NOT NULL,
    iv             TEXT NOT NULL,             -- base64
    encrypted_keys TEXT NOT NULL,             -- JSON object nickname -> base64
    allowed_users  TEXT NOT NULL,             -- JSON array
    chunk_hashes   TEXT NOT NULL,             -- JSON array of hex sha256
    chunk_size     INTEGER NOT NULL,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_files_owner ON files(owner);

-- ----------------------------------------------------------------
-- Revocations (append-only)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS revocations (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    file_hash    TEXT NOT NULL,
    revoked_user TEXT NOT NULL,
    revoked_by   TEXT NOT NULL,
    timestamp    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_revocations_file_user
    ON revocations(file_hash, revoked_user);

-- ----------------------------------------------------------------
-- Audit log (append-only)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS audit_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   TEXT NOT NULL,
    acting_user TEXT,
    file_hash   TEXT,
    action_type TEXT NOT NULL,
    status      TEXT NOT NULL,
    details     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_file ON audit_log(file_hash, id);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
