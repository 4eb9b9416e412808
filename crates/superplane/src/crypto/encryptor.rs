use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::prelude::*;
use rand::RngCore;
use thiserror::Error;

use crate::error::Error;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption key must be {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("encryption key is not valid base64")]
    InvalidKeyEncoding,

    #[error("ciphertext too short")]
    Truncated,

    #[error("encryption failed")]
    Encrypt,

    /// Wrong key, wrong associated data, or tampered ciphertext.
    #[error("decryption failed")]
    Decrypt,
}

impl From<CryptoError> for Error {
    fn from(err: CryptoError) -> Self {
        Error::Config(err.to_string())
    }
}

/// Authenticated encryption bound to a logical identity.
///
/// `aad` is the name the secret belongs to (event-source name, secret name),
/// so a ciphertext cannot be replayed under another identity.
pub trait Encryptor: Send + Sync + 'static {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// AES-256-GCM. Output layout: 12-byte random nonce followed by the sealed box.
#[derive(Clone)]
pub struct AesGcmEncryptor {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for AesGcmEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesGcmEncryptor")
    }
}

impl AesGcmEncryptor {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength(key.len()));
        }
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
        Ok(Self { cipher })
    }

    /// Build from a base64-encoded 32-byte key, as carried in configuration.
    pub fn from_base64(key: &str) -> Result<Self, CryptoError> {
        let raw = BASE64_STANDARD
            .decode(key.trim())
            .map_err(|_| CryptoError::InvalidKeyEncoding)?;
        Self::new(&raw)
    }
}

impl Encryptor for AesGcmEncryptor {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < NONCE_LEN {
            return Err(CryptoError::Truncated);
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: sealed, aad })
            .map_err(|_| CryptoError::Decrypt)
    }
}

/// Pass-through encryptor. Only for tests and local development.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpEncryptor;

impl Encryptor for NoOpEncryptor {
    fn encrypt(&self, plaintext: &[u8], _aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8], _aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(ciphertext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encryptor() -> AesGcmEncryptor {
        AesGcmEncryptor::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn decrypts_with_same_aad() {
        let enc = encryptor();
        let sealed = enc.encrypt(b"hunter2", b"github-source").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"hunter2");
        assert_eq!(enc.decrypt(&sealed, b"github-source").unwrap(), b"hunter2");
    }

    #[test]
    fn rejects_different_aad_or_key() {
        let enc = encryptor();
        let sealed = enc.encrypt(b"hunter2", b"github-source").unwrap();
        assert_eq!(enc.decrypt(&sealed, b"other-source"), Err(CryptoError::Decrypt));

        let other = AesGcmEncryptor::new(&[8u8; 32]).unwrap();
        assert_eq!(other.decrypt(&sealed, b"github-source"), Err(CryptoError::Decrypt));
    }

    #[test]
    fn nonces_are_fresh_per_call() {
        let enc = encryptor();
        let a = enc.encrypt(b"same", b"aad").unwrap();
        let b = enc.encrypt(b"same", b"aad").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn key_validation() {
        assert_eq!(
            AesGcmEncryptor::new(&[1u8; 16]).unwrap_err(),
            CryptoError::InvalidKeyLength(16)
        );
        let key = BASE64_STANDARD.encode([3u8; 32]);
        assert!(AesGcmEncryptor::from_base64(&key).is_ok());
        assert_eq!(
            AesGcmEncryptor::from_base64("%%%").unwrap_err(),
            CryptoError::InvalidKeyEncoding
        );
        assert_eq!(encryptor().decrypt(b"short", b""), Err(CryptoError::Truncated));
    }

    #[test]
    fn noop_passes_through() {
        let enc = NoOpEncryptor;
        let sealed = enc.encrypt(b"plain", b"x").unwrap();
        assert_eq!(enc.decrypt(&sealed, b"y").unwrap(), b"plain");
    }
}
