//! CRUD operations for [`User`] records.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::database::{parse_timestamp, Database};
use crate::error::{Result, StoreError};
use crate::models::User;

impl Database {
    /// Register a nickname or supersede its public key. The original
    /// `created_at` is preserved.
    pub fn upsert_user(&self, nickname: &str, public_key: &str) -> Result<User> {
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO users (nickname, public_key, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(nickname) DO UPDATE SET
                public_key = excluded.public_key,
                updated_at = excluded.updated_at",
            params![nickname, public_key, now],
        )?;
        self.get_user(nickname)
    }

    /// Fetch a user by nickname.
    pub fn get_user(&self, nickname: &str) -> Result<User> {
        self.find_user(nickname)?
            .ok_or_else(|| StoreError::missing("user", nickname))
    }

    pub fn find_user(&self, nickname: &str) -> Result<Option<User>> {
        let user = self
            .conn()
            .query_row(
                "SELECT nickname, public_key, created_at, updated_at
                 FROM users
                 WHERE nickname = ?1",
                params![nickname],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    /// List every registered user, ordered by nickname.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self.conn().prepare(
            "SELECT nickname, public_key, created_at, updated_at
             FROM users
             ORDER BY nickname ASC",
        )?;

        let rows = stmt.query_map([], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let created: String = row.get(2)?;
    let updated: String = row.get(3)?;
    Ok(User {
        nickname: row.get(0)?,
        public_key: row.get(1)?,
        created_at: parse_timestamp(2, &created)?,
        updated_at: parse_timestamp(3, &updated)?,
    })
}
