//! # hubshare-shared
//!
//! Types and primitives shared by the hub and by peers: the error
//! taxonomy, RSA/AES crypto helpers, deterministic chunk hashing, the JSON
//! wire protocols, and hub session credentials.

pub mod constants;
pub mod chunks;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod session;
pub mod types;

pub use error::{CryptoError, ShareError};
