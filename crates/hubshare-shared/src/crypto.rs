use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::constants::{AES_IV_SIZE, AES_KEY_SIZE, NONCE_SIZE};
use crate::error::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub type AesKey = [u8; AES_KEY_SIZE];
pub type AesIv = [u8; AES_IV_SIZE];
pub type SymmetricKey = [u8; 32];

/// A fresh AES-256 key and IV. One is generated per share and per rotation;
/// it is never reused across files.
#[derive(Clone)]
pub struct SessionKey {
    pub key: AesKey,
    pub iv: AesIv,
}

impl SessionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; AES_KEY_SIZE];
        let mut iv = [0u8; AES_IV_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut key);
        rand::rngs::OsRng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    pub fn iv_base64(&self) -> String {
        STANDARD.encode(self.iv)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        aes_encrypt(&self.key, &self.iv, plaintext)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey").finish_non_exhaustive()
    }
}

/// AES-256-CBC with PKCS#7 padding.
pub fn aes_encrypt(key: &AesKey, iv: &AesIv, plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

pub fn aes_decrypt(key: &AesKey, iv: &AesIv, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

pub fn decode_iv(iv_b64: &str) -> Result<AesIv, CryptoError> {
    let bytes = STANDARD
        .decode(iv_b64.trim())
        .map_err(|_| CryptoError::Base64Decode)?;
    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)
}

pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    if !pem.contains("-----BEGIN PUBLIC KEY-----") {
        return Err(CryptoError::InvalidPublicKey(
            "missing PEM headers".to_string(),
        ));
    }
    RsaPublicKey::from_public_key_pem(pem).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Wrap an AES key for one recipient with RSA-OAEP(SHA-256). Returns base64.
pub fn wrap_key_for_recipient(public_key_pem: &str, key: &AesKey) -> Result<String, CryptoError> {
    let public_key = parse_public_key(public_key_pem)?;
    let wrapped = public_key
        .encrypt(&mut rand::rngs::OsRng, Oaep::new::<Sha256>(), key)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok(STANDARD.encode(wrapped))
}

pub fn unwrap_key(private_key: &RsaPrivateKey, wrapped_b64: &str) -> Result<AesKey, CryptoError> {
    let wrapped = STANDARD
        .decode(wrapped_b64.trim())
        .map_err(|_| CryptoError::Base64Decode)?;
    let key = private_key
        .decrypt(Oaep::new::<Sha256>(), &wrapped)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    key.try_into().map_err(|_| CryptoError::InvalidKeyLength)
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn open(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

pub fn derive_key_from_passphrase(passphrase: &[u8], context: &str) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(passphrase);
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerKeys;

    #[test]
    fn test_aes_roundtrip() {
        let session = SessionKey::generate();
        let plaintext = b"three chunks of very secret data";

        let ciphertext = session.encrypt(plaintext);
        assert_ne!(&ciphertext[..], &plaintext[..]);
        // PKCS#7 always pads to the next full block
        assert_eq!(ciphertext.len() % 16, 0);

        let decrypted = aes_decrypt(&session.key, &session.iv, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_aes_wrong_key_fails() {
        let a = SessionKey::generate();
        let b = SessionKey::generate();
        let ciphertext = a.encrypt(&[7u8; 100]);

        match aes_decrypt(&b.key, &a.iv, &ciphertext) {
            Err(_) => {}
            Ok(plain) => assert_ne!(plain, vec![7u8; 100]),
        }
    }

    #[test]
    fn test_fresh_session_keys_differ() {
        let a = SessionKey::generate();
        let b = SessionKey::generate();
        assert_ne!(a.key, b.key);
        assert_ne!(a.iv, b.iv);
    }

    #[test]
    fn test_wrap_unwrap_for_recipient() {
        let recipient = PeerKeys::generate_with_bits(1024).unwrap();
        let session = SessionKey::generate();

        let wrapped = wrap_key_for_recipient(&recipient.public_pem().unwrap(), &session.key).unwrap();
        let unwrapped = unwrap_key(recipient.private_key(), &wrapped).unwrap();
        assert_eq!(unwrapped, session.key);
    }

    #[test]
    fn test_unwrap_with_other_identity_fails() {
        let alice = PeerKeys::generate_with_bits(1024).unwrap();
        let mallory = PeerKeys::generate_with_bits(1024).unwrap();
        let session = SessionKey::generate();

        let wrapped = wrap_key_for_recipient(&alice.public_pem().unwrap(), &session.key).unwrap();
        assert!(unwrap_key(mallory.private_key(), &wrapped).is_err());
    }

    #[test]
    fn test_rejects_non_pem_public_key() {
        let key = [0u8; 32];
        assert!(matches!(
            wrap_key_for_recipient("not a key", &key),
            Err(CryptoError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn test_iv_base64_roundtrip() {
        let session = SessionKey::generate();
        assert_eq!(decode_iv(&session.iv_base64()).unwrap(), session.iv);
        assert!(decode_iv("AAAA").is_err());
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = derive_key_from_passphrase(b"hunter2", "test-context");
        let sealed = seal(&key, b"private key material").unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), b"private key material");

        let other = derive_key_from_passphrase(b"hunter3", "test-context");
        assert!(open(&other, &sealed).is_err());
        assert!(open(&key, &[]).is_err());
    }
}
