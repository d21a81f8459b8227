//! Message security: AES-256-GCM payload encryption and HMAC-SHA256
//! signing with constant-time verification.
//!
//! Key material is zeroed when the implementations drop. Tag or
//! ciphertext mutation yields `DecryptionFailed`; signature verification
//! never reveals where a comparison diverged.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use qv_common::QuiverError;

type HmacSha256 = Hmac<Sha256>;

const GCM_TAG_LEN: usize = 16;
const GCM_NONCE_LEN: usize = 12;

#[derive(Debug, Clone)]
pub struct EncryptedPayload {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; GCM_NONCE_LEN],
    pub tag: [u8; GCM_TAG_LEN],
    pub key_id: Option<String>,
    pub algorithm: &'static str,
}

pub trait MessageEncryptor: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> qv_common::Result<EncryptedPayload>;

    /// Verifies the authentication tag; any mutation of ciphertext, iv,
    /// or tag fails with `DecryptionFailed`.
    fn decrypt(&self, payload: &EncryptedPayload) -> qv_common::Result<Vec<u8>>;
}

pub struct AesGcmEncryptor {
    key: [u8; 32],
    key_id: Option<String>,
}

impl AesGcmEncryptor {
    pub const ALGORITHM: &'static str = "AES-256-GCM";

    pub fn new(key: [u8; 32]) -> Self {
        Self { key, key_id: None }
    }

    pub fn with_key_id(key: [u8; 32], key_id: impl Into<String>) -> Self {
        Self {
            key,
            key_id: Some(key_id.into()),
        }
    }

    fn cipher(&self) -> qv_common::Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|_| QuiverError::DecryptionFailed)
    }
}

impl Drop for AesGcmEncryptor {
    fn drop(&mut self) {
        // Zero out key material on drop
        self.key.zeroize();
    }
}

impl MessageEncryptor for AesGcmEncryptor {
    fn encrypt(&self, plaintext: &[u8]) -> qv_common::Result<EncryptedPayload> {
        let cipher = self.cipher()?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        // The aead crate appends the tag to the ciphertext; the payload
        // carries it separately
        let mut combined = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| QuiverError::DecryptionFailed)?;
        let tag_start = combined.len() - GCM_TAG_LEN;
        let tag_bytes = combined.split_off(tag_start);

        let mut iv = [0u8; GCM_NONCE_LEN];
        iv.copy_from_slice(&nonce);
        let mut tag = [0u8; GCM_TAG_LEN];
        tag.copy_from_slice(&tag_bytes);

        Ok(EncryptedPayload {
            ciphertext: combined,
            iv,
            tag,
            key_id: self.key_id.clone(),
            algorithm: Self::ALGORITHM,
        })
    }

    fn decrypt(&self, payload: &EncryptedPayload) -> qv_common::Result<Vec<u8>> {
        if payload.algorithm != Self::ALGORITHM {
            return Err(QuiverError::DecryptionFailed);
        }
        let cipher = self.cipher()?;
        let nonce = Nonce::from_slice(&payload.iv);

        let mut combined = payload.ciphertext.clone();
        combined.extend_from_slice(&payload.tag);

        cipher
            .decrypt(nonce, combined.as_slice())
            .map_err(|_| QuiverError::DecryptionFailed)
    }
}

// ============================================================================
// Signing
// ============================================================================

#[derive(Debug, Clone)]
pub struct Signature {
    /// Hex-encoded MAC.
    pub signature: String,
    pub algorithm: &'static str,
    pub key_id: Option<String>,
    /// Included in the MAC input, binding the signature to its moment of
    /// creation.
    pub timestamp: DateTime<Utc>,
}

pub trait MessageSigner: Send + Sync {
    fn sign(&self, data: &[u8]) -> qv_common::Result<Signature>;

    /// Constant-time comparison; any single-bit flip in data or signature
    /// verifies false.
    fn verify(&self, data: &[u8], signature: &Signature) -> qv_common::Result<bool>;
}

pub struct HmacSha256Signer {
    secret: Vec<u8>,
    key_id: Option<String>,
}

impl HmacSha256Signer {
    pub const ALGORITHM: &'static str = "HMAC-SHA256";

    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            key_id: None,
        }
    }

    pub fn with_key_id(secret: impl Into<Vec<u8>>, key_id: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            key_id: Some(key_id.into()),
        }
    }

    fn mac_for(&self, data: &[u8], timestamp: &DateTime<Utc>) -> qv_common::Result<Vec<u8>> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .map_err(|_| QuiverError::SignatureInvalid)?;
        mac.update(timestamp.to_rfc3339().as_bytes());
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

impl Drop for HmacSha256Signer {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl MessageSigner for HmacSha256Signer {
    fn sign(&self, data: &[u8]) -> qv_common::Result<Signature> {
        let timestamp = Utc::now();
        let mac = self.mac_for(data, &timestamp)?;
        Ok(Signature {
            signature: hex::encode(mac),
            algorithm: Self::ALGORITHM,
            key_id: self.key_id.clone(),
            timestamp,
        })
    }

    fn verify(&self, data: &[u8], signature: &Signature) -> qv_common::Result<bool> {
        if signature.algorithm != Self::ALGORITHM {
            return Ok(false);
        }
        let Ok(claimed) = hex::decode(&signature.signature) else {
            return Ok(false);
        };
        let expected = self.mac_for(data, &signature.timestamp)?;
        Ok(expected.ct_eq(&claimed).into())
    }
}
