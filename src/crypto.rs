//! Secrets Helper
//!
//! Authenticated encryption for sensitive values held at rest (audit
//! payloads, stored tokens). Uses XChaCha20-Poly1305 with a random 24-byte
//! nonce per message. Decryption of tampered or corrupt data fails closed.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Algorithm label stored alongside every sealed payload
pub const ALGORITHM: &str = "xchacha20poly1305";

/// Associated data used by [`SecretBox::encrypt`] / [`SecretBox::decrypt`]
const DEFAULT_PURPOSE: &[u8] = b"execgate:secret";

const COMPACT_VERSION: &str = "v1";
const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

/// Crypto errors
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("key environment variable '{0}' is not set")]
    MissingKey(String),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("malformed ciphertext: {0}")]
    Malformed(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

/// A sealed (encrypted + authenticated) payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedPayload {
    pub alg: String,
    pub nonce_b64: String,
    pub ciphertext_b64: String,
}

impl SealedPayload {
    /// Encode as `v1.<nonce>.<ciphertext>`
    pub fn to_compact(&self) -> String {
        format!("{}.{}.{}", COMPACT_VERSION, self.nonce_b64, self.ciphertext_b64)
    }

    /// Parse the compact form produced by [`SealedPayload::to_compact`]
    pub fn from_compact(compact: &str) -> Result<Self, CryptoError> {
        let mut parts = compact.splitn(3, '.');
        let (Some(version), Some(nonce), Some(ciphertext)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(CryptoError::Malformed("expected three segments".to_string()));
        };
        if version != COMPACT_VERSION {
            return Err(CryptoError::Malformed(format!("unknown version '{}'", version)));
        }
        Ok(Self {
            alg: ALGORITHM.to_string(),
            nonce_b64: nonce.to_string(),
            ciphertext_b64: ciphertext.to_string(),
        })
    }
}

/// Symmetric key holder; keys live only in memory for the process lifetime
pub struct SecretBox {
    cipher: XChaCha20Poly1305,
}

impl fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBox").field("alg", &ALGORITHM).finish_non_exhaustive()
    }
}

impl SecretBox {
    /// Build from raw key bytes
    pub fn from_key(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Build from a base64-encoded 32-byte key
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = B64
            .decode(encoded.trim().as_bytes())
            .map_err(|_| CryptoError::InvalidKey("not valid base64".to_string()))?;
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| CryptoError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, b.len())))?;
        Ok(Self::from_key(&key))
    }

    /// Load the key from an environment variable holding base64
    pub fn from_env(var: &str) -> Result<Self, CryptoError> {
        let encoded = std::env::var(var).map_err(|_| CryptoError::MissingKey(var.to_string()))?;
        Self::from_base64(&encoded)
    }

    /// Generate a random key, returning the box and the base64 key
    pub fn generate() -> (Self, String) {
        let key: [u8; KEY_LEN] = rand::random();
        (Self::from_key(&key), B64.encode(key))
    }

    /// Encrypt `plaintext`, binding it to `purpose` as associated data
    pub fn seal(&self, plaintext: &[u8], purpose: &[u8]) -> Result<SealedPayload, CryptoError> {
        let nonce: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: purpose,
                },
            )
            .map_err(|_| CryptoError::Encrypt)?;
        Ok(SealedPayload {
            alg: ALGORITHM.to_string(),
            nonce_b64: B64.encode(nonce),
            ciphertext_b64: B64.encode(ciphertext),
        })
    }

    /// Decrypt a sealed payload; any tampering yields an error, never partial data
    pub fn open(&self, sealed: &SealedPayload, purpose: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.alg != ALGORITHM {
            return Err(CryptoError::UnsupportedAlgorithm(sealed.alg.clone()));
        }
        let nonce = B64
            .decode(sealed.nonce_b64.as_bytes())
            .map_err(|_| CryptoError::Malformed("invalid nonce".to_string()))?;
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::Malformed("invalid nonce length".to_string()));
        }
        let ciphertext = B64
            .decode(sealed.ciphertext_b64.as_bytes())
            .map_err(|_| CryptoError::Malformed("invalid ciphertext".to_string()))?;

        self.cipher
            .decrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: purpose,
                },
            )
            .map_err(|_| CryptoError::Decrypt)
    }

    /// Encrypt to the compact string form
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        Ok(self.seal(plaintext, DEFAULT_PURPOSE)?.to_compact())
    }

    /// Decrypt the compact string form
    pub fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, CryptoError> {
        let sealed = SealedPayload::from_compact(ciphertext)?;
        self.open(&sealed, DEFAULT_PURPOSE)
    }
}
