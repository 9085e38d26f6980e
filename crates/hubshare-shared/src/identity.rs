use std::path::Path;

use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::info;

use crate::constants::{KDF_CONTEXT_KEYSTORE, RSA_KEY_BITS};
use crate::crypto::{self, AesKey};
use crate::error::CryptoError;

const PRIVATE_KEY_FILE: &str = "private.pem";
const SEALED_PRIVATE_KEY_FILE: &str = "private.pem.sealed";
const PUBLIC_KEY_FILE: &str = "public.pem";

/// A peer's RSA keypair. The public half is registered with the hub and
/// used by other peers to wrap session keys for us.
#[derive(Clone)]
pub struct PeerKeys {
    private_key: RsaPrivateKey,
}

impl PeerKeys {
    /// Generate a new RSA-2048 keypair
    pub fn generate() -> Result<Self, CryptoError> {
        Self::generate_with_bits(RSA_KEY_BITS)
    }

    pub fn generate_with_bits(bits: usize) -> Result<Self, CryptoError> {
        let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, bits)
            .map_err(|_| CryptoError::GenerationFailed)?;
        Ok(Self { private_key })
    }

    /// Restore from a PKCS#8 PEM private key
    pub fn from_private_pem(pem: &str) -> Result<Self, CryptoError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self { private_key })
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.private_key.to_public_key()
    }

    /// SPKI PEM of the public key, the format the hub stores.
    pub fn public_pem(&self) -> Result<String, CryptoError> {
        self.public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyFile(e.to_string()))
    }

    fn private_pem(&self) -> Result<String, CryptoError> {
        self.private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| CryptoError::KeyFile(e.to_string()))
    }

    /// Recover the AES key another peer wrapped for us.
    pub fn unwrap_session_key(&self, wrapped_b64: &str) -> Result<AesKey, CryptoError> {
        crypto::unwrap_key(&self.private_key, wrapped_b64)
    }

    /// Load the keypair stored in `dir`, or generate and persist a new one.
    ///
    /// With a passphrase the private key is sealed at rest
    /// (XChaCha20-Poly1305 under a BLAKE3-derived key); without one it is
    /// written as plain PKCS#8 PEM.
    pub fn load_or_generate(dir: &Path, passphrase: Option<&str>) -> Result<Self, CryptoError> {
        Self::load_or_generate_with_bits(dir, passphrase, RSA_KEY_BITS)
    }

    pub fn load_or_generate_with_bits(
        dir: &Path,
        passphrase: Option<&str>,
        bits: usize,
    ) -> Result<Self, CryptoError> {
        std::fs::create_dir_all(dir).map_err(|e| CryptoError::KeyFile(e.to_string()))?;

        let sealed_path = dir.join(SEALED_PRIVATE_KEY_FILE);
        let plain_path = dir.join(PRIVATE_KEY_FILE);

        if let Some(passphrase) = passphrase {
            if sealed_path.exists() {
                let data =
                    std::fs::read(&sealed_path).map_err(|e| CryptoError::KeyFile(e.to_string()))?;
                let key = crypto::derive_key_from_passphrase(passphrase.as_bytes(), KDF_CONTEXT_KEYSTORE);
                let pem = crypto::open(&key, &data)?;
                let pem = String::from_utf8(pem)
                    .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
                info!(path = %sealed_path.display(), "Loaded sealed RSA key pair");
                return Self::from_private_pem(&pem);
            }
        } else if plain_path.exists() {
            let pem = std::fs::read_to_string(&plain_path)
                .map_err(|e| CryptoError::KeyFile(e.to_string()))?;
            info!(path = %plain_path.display(), "Loaded RSA key pair");
            return Self::from_private_pem(&pem);
        }

        let keys = Self::generate_with_bits(bits)?;
        keys.persist(dir, passphrase)?;
        info!(dir = %dir.display(), sealed = passphrase.is_some(), "Generated new RSA key pair");
        Ok(keys)
    }

    fn persist(&self, dir: &Path, passphrase: Option<&str>) -> Result<(), CryptoError> {
        let private_pem = self.private_pem()?;
        match passphrase {
            Some(passphrase) => {
                let key = crypto::derive_key_from_passphrase(passphrase.as_bytes(), KDF_CONTEXT_KEYSTORE);
                let sealed = crypto::seal(&key, private_pem.as_bytes())?;
                std::fs::write(dir.join(SEALED_PRIVATE_KEY_FILE), sealed)
            }
            None => std::fs::write(dir.join(PRIVATE_KEY_FILE), private_pem.as_bytes()),
        }
        .map_err(|e| CryptoError::KeyFile(e.to_string()))?;

        std::fs::write(dir.join(PUBLIC_KEY_FILE), self.public_pem()?)
            .map_err(|e| CryptoError::KeyFile(e.to_string()))
    }
}
