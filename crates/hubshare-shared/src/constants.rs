/// Fixed ciphertext chunk size used by the transfer protocol (64 KiB)
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Largest chunk size a downloader accepts from an uploader (1 MiB)
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Download token lifetime in seconds (5 minutes)
pub const DOWNLOAD_TOKEN_TTL_SECS: i64 = 300;

/// Hub session credential lifetime in seconds (1 hour)
pub const SESSION_TOKEN_TTL_SECS: i64 = 3600;

/// RSA modulus size for peer keypairs
pub const RSA_KEY_BITS: usize = 2048;

/// AES-256 key size in bytes
pub const AES_KEY_SIZE: usize = 32;

/// AES-CBC IV size in bytes
pub const AES_IV_SIZE: usize = 16;

/// XChaCha20-Poly1305 nonce size in bytes (private key sealing)
pub const NONCE_SIZE: usize = 24;

/// Maximum size of a file that can be shared (1 GiB)
pub const MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// How many times a single chunk may be re-requested before a transfer fails
pub const MAX_CHUNK_RETRIES: u32 = 3;

/// Default hub HTTP/WebSocket port
pub const DEFAULT_HUB_PORT: u16 = 3000;

/// Default uploader peer port
pub const DEFAULT_UPLOADER_PORT: u16 = 4000;

/// Key derivation context (BLAKE3) for sealing the private key at rest
pub const KDF_CONTEXT_KEYSTORE: &str = "hubshare-keystore-v1";
