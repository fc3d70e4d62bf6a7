//! At-rest sealing for token files.
//!
//! Sealed records are JSON envelopes holding a random nonce and the
//! ChaCha20-Poly1305 ciphertext. The key is either raw bytes (kept in the OS
//! keychain) or derived from a passphrase with Argon2, in which case the salt
//! travels in the envelope.

use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENVELOPE_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("Sealed record is malformed: {0}")]
    Malformed(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Decryption failed - wrong key or tampered record")]
    Decrypt,

    #[error("Encryption failed")]
    Encrypt,
}

enum KeySource {
    Raw([u8; KEY_LEN]),
    Passphrase(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct SealedRecord {
    version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    salt: Option<String>,
    nonce: String,
    ciphertext: String,
}

pub struct TokenCipher {
    source: KeySource,
}

impl TokenCipher {
    pub fn with_key(key: [u8; KEY_LEN]) -> Self {
        Self {
            source: KeySource::Raw(key),
        }
    }

    pub fn with_passphrase(passphrase: impl Into<String>) -> Self {
        Self {
            source: KeySource::Passphrase(passphrase.into()),
        }
    }

    /// Generate a fresh random key suitable for [`TokenCipher::with_key`].
    pub fn generate_key() -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        key
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let salt = match self.source {
            KeySource::Passphrase(_) => {
                let mut salt = [0u8; SALT_LEN];
                OsRng.fill_bytes(&mut salt);
                Some(salt.to_vec())
            }
            KeySource::Raw(_) => None,
        };
        let key = self.key_for(salt.as_deref())?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CipherError::Encrypt)?;

        let record = SealedRecord {
            version: ENVELOPE_VERSION,
            salt: salt.map(|s| STANDARD.encode(s)),
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
        };
        serde_json::to_vec_pretty(&record).map_err(|e| CipherError::Malformed(e.to_string()))
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        let record: SealedRecord =
            serde_json::from_slice(sealed).map_err(|e| CipherError::Malformed(e.to_string()))?;
        if record.version != ENVELOPE_VERSION {
            return Err(CipherError::Malformed(format!(
                "unsupported envelope version {}",
                record.version
            )));
        }

        let salt = record.salt.as_deref().map(decode).transpose()?;
        let nonce = decode(&record.nonce)?;
        if nonce.len() != NONCE_LEN {
            return Err(CipherError::Malformed("bad nonce length".to_string()));
        }
        let ciphertext = decode(&record.ciphertext)?;

        let key = self.key_for(salt.as_deref())?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| CipherError::Decrypt)
    }

    fn key_for(&self, salt: Option<&[u8]>) -> Result<[u8; KEY_LEN], CipherError> {
        match &self.source {
            KeySource::Raw(key) => Ok(*key),
            KeySource::Passphrase(passphrase) => {
                let salt = salt.ok_or_else(|| {
                    CipherError::Malformed("passphrase record without salt".to_string())
                })?;
                let mut key = [0u8; KEY_LEN];
                Argon2::default()
                    .hash_password_into(passphrase.as_bytes(), salt, &mut key)
                    .map_err(|e| CipherError::KeyDerivation(e.to_string()))?;
                Ok(key)
            }
        }
    }
}

fn decode(value: &str) -> Result<Vec<u8>, CipherError> {
    STANDARD
        .decode(value)
        .map_err(|e| CipherError::Malformed(e.to_string()))
}
