use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Creating the database directory failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No user or file row under the given key.
    #[error("No {kind} stored under {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("Migration v{version} failed: {reason}")]
    Migration { version: u32, reason: String },

    /// `encrypted_keys`, `allowed_users` or `chunk_hashes` column.
    #[error("Malformed JSON column: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed timestamp: {0}")]
    ChronoParse(#[from] chrono::ParseError),
}

impl StoreError {
    pub(crate) fn missing(kind: &'static str, key: &str) -> Self {
        StoreError::NotFound { kind, key: key.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
