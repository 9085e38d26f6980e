use thiserror::Error;

/// Outcome taxonomy for every security-relevant decision and transfer
/// failure. Variants other than `AuthenticationFailed` are local to the
/// request that produced them.
#[derive(Error, Debug)]
pub enum ShareError {
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Only the owner of this file may do that")]
    NotOwner,

    #[error("Access denied")]
    AccessDenied,

    #[error("Download token expired")]
    TokenExpired,

    #[error("Download token not found")]
    TokenNotFound,

    #[error("Download token was issued for a different file")]
    TokenFileMismatch,

    #[error("Hash mismatch at chunk {chunk}")]
    HashMismatch { chunk: u32 },

    #[error("File not found")]
    FileNotFound,

    #[error("Invalid request: {0}")]
    ValidationError(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShareError {
    /// Whether the error must tear down the connection it happened on.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, ShareError::AuthenticationFailed)
    }

    /// Whether the decision behind this error belongs in the audit log.
    pub fn is_security_decision(&self) -> bool {
        matches!(
            self,
            ShareError::AuthenticationFailed
                | ShareError::NotOwner
                | ShareError::AccessDenied
                | ShareError::TokenExpired
                | ShareError::TokenNotFound
                | ShareError::TokenFileMismatch
        )
    }
}

impl ShareError {
    /// Stable machine-readable code carried next to the human text in
    /// `error` wire messages.
    pub fn code(&self) -> &'static str {
        match self {
            ShareError::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ShareError::NotOwner => "NOT_OWNER",
            ShareError::AccessDenied => "ACCESS_DENIED",
            ShareError::TokenExpired => "TOKEN_EXPIRED",
            ShareError::TokenNotFound => "TOKEN_NOT_FOUND",
            ShareError::TokenFileMismatch => "TOKEN_FILE_MISMATCH",
            ShareError::HashMismatch { .. } => "HASH_MISMATCH",
            ShareError::FileNotFound => "FILE_NOT_FOUND",
            ShareError::ValidationError(_) => "VALIDATION_ERROR",
            ShareError::Crypto(_) => "CRYPTO_ERROR",
            ShareError::Transport(_) => "TRANSPORT_ERROR",
            ShareError::Protocol(_) => "PROTOCOL_ERROR",
            ShareError::Io(_) => "IO_ERROR",
        }
    }

    /// Rebuild an error received from a remote party.
    pub fn from_wire(code: Option<&str>, text: &str) -> Self {
        match code {
            Some("AUTHENTICATION_FAILED") => ShareError::AuthenticationFailed,
            Some("NOT_OWNER") => ShareError::NotOwner,
            Some("ACCESS_DENIED") => ShareError::AccessDenied,
            Some("TOKEN_EXPIRED") => ShareError::TokenExpired,
            Some("TOKEN_NOT_FOUND") => ShareError::TokenNotFound,
            Some("TOKEN_FILE_MISMATCH") => ShareError::TokenFileMismatch,
            Some("FILE_NOT_FOUND") => ShareError::FileNotFound,
            Some("VALIDATION_ERROR") => ShareError::ValidationError(text.to_string()),
            Some("TRANSPORT_ERROR") => ShareError::Transport(text.to_string()),
            _ => ShareError::Protocol(text.to_string()),
        }
    }
}

impl From<serde_json::Error> for ShareError {
    fn from(e: serde_json::Error) -> Self {
        ShareError::Protocol(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Failed to generate keypair")]
    GenerationFailed,

    #[error("Key file error: {0}")]
    KeyFile(String),

    #[error("Base64 decode error")]
    Base64Decode,
}
