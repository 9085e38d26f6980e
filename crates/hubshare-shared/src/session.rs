use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::ShareError;

/// Bearer credential a peer presents when connecting to the hub. Issued
/// by a credential authority; the hub only holds the verifying key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    pub nickname: String,
    pub valid_until: DateTime<Utc>,
    pub signature: Vec<u8>,
}

// payload = nickname || 0x00 || valid_until (rfc3339)
fn signing_payload(nickname: &str, valid_until: &DateTime<Utc>) -> Vec<u8> {
    let mut payload = Vec::with_capacity(nickname.len() + 40);
    payload.extend_from_slice(nickname.as_bytes());
    payload.push(0);
    payload.extend_from_slice(valid_until.to_rfc3339().as_bytes());
    payload
}

impl SessionToken {
    pub fn create(nickname: &str, valid_until: DateTime<Utc>, authority: &SigningKey) -> Self {
        let signature = authority.sign(&signing_payload(nickname, &valid_until));
        Self {
            nickname: nickname.to_string(),
            valid_until,
            signature: signature.to_bytes().to_vec(),
        }
    }

    /// Check expiry and the authority's signature. Returns the nickname the
    /// token vouches for.
    pub fn verify(&self, authority_pubkey: &[u8; 32]) -> Result<&str, ShareError> {
        if Utc::now() > self.valid_until {
            return Err(ShareError::AuthenticationFailed);
        }
        if self.nickname.is_empty() {
            return Err(ShareError::AuthenticationFailed);
        }

        let verifying_key = VerifyingKey::from_bytes(authority_pubkey)
            .map_err(|_| ShareError::AuthenticationFailed)?;
        let signature =
            Signature::from_slice(&self.signature).map_err(|_| ShareError::AuthenticationFailed)?;

        verifying_key
            .verify(&signing_payload(&self.nickname, &self.valid_until), &signature)
            .map_err(|_| ShareError::AuthenticationFailed)?;
        Ok(&self.nickname)
    }

    /// Encode as a base64url string suitable for a query parameter.
    pub fn encode(&self) -> Result<String, ShareError> {
        let bytes = bincode::serialize(self).map_err(|e| ShareError::Protocol(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn decode(code: &str) -> Result<Self, ShareError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(code.trim())
            .map_err(|_| ShareError::AuthenticationFailed)?;
        bincode::deserialize(&bytes).map_err(|_| ShareError::AuthenticationFailed)
    }
}
