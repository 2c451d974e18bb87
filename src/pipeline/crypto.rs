//! Artifact encryption and fingerprinting.
//!
//! Artifacts are sealed with AES-256-GCM. The stored layout is
//! `nonce (12 bytes) || ciphertext || tag (16 bytes)`.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// AES-GCM nonce size in bytes.
pub const NONCE_SIZE: usize = 12;
/// AES-GCM authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;
/// Key size in bytes.
pub const KEY_SIZE: usize = 32;

/// Errors that can occur during encryption or decryption.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length: expected {KEY_SIZE} bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid hex key: {0}")]
    InvalidHexKey(#[from] hex::FromHexError),

    #[error("Encryption failed")]
    EncryptFailed,

    #[error("Ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),

    #[error("Decryption failed: data corrupted or wrong key")]
    DecryptFailed,
}

/// Symmetric cipher holding one key for the lifetime of the process.
#[derive(Clone)]
pub struct ArtifactCipher {
    cipher: Aes256Gcm,
}

impl ArtifactCipher {
    /// Creates a cipher with a freshly generated random key.
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Creates a cipher from raw key bytes.
    pub fn from_key(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength(key.len()));
        }
        let key = Key::<Aes256Gcm>::from_slice(key);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Creates a cipher from a hex-encoded key.
    pub fn from_hex(key: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(key.trim())?;
        Self::from_key(&bytes)
    }

    /// Encrypts `plaintext` under a random nonce, prepending the nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::EncryptFailed)?;

        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(nonce.as_slice());
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    /// Decrypts data produced by [`ArtifactCipher::encrypt`].
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::CiphertextTooShort(sealed.len()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)
    }
}

impl std::fmt::Debug for ArtifactCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCipher").finish_non_exhaustive()
    }
}

/// Computes the hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = ArtifactCipher::generate();
        let sealed = cipher.encrypt(b"artifact bytes").expect("encrypt should work");

        assert_eq!(sealed.len(), NONCE_SIZE + b"artifact bytes".len() + TAG_SIZE);
        assert_ne!(&sealed[NONCE_SIZE..NONCE_SIZE + 14], b"artifact bytes");
        assert_eq!(
            cipher.decrypt(&sealed).expect("decrypt should work"),
            b"artifact bytes"
        );
    }

    #[test]
    fn test_nonce_differs_per_call() {
        let cipher = ArtifactCipher::generate();
        let a = cipher.encrypt(b"same").expect("encrypt should work");
        let b = cipher.encrypt(b"same").expect("encrypt should work");
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = ArtifactCipher::generate()
            .encrypt(b"secret")
            .expect("encrypt should work");
        assert!(matches!(
            ArtifactCipher::generate().decrypt(&sealed),
            Err(CryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn test_tampered_data_fails() {
        let cipher = ArtifactCipher::generate();
        let mut sealed = cipher.encrypt(b"secret").expect("encrypt should work");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(cipher.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_short_ciphertext() {
        let cipher = ArtifactCipher::generate();
        assert!(matches!(
            cipher.decrypt(&[0u8; 10]),
            Err(CryptoError::CiphertextTooShort(10))
        ));
    }

    #[test]
    fn test_from_hex_key() {
        let key = "00".repeat(KEY_SIZE);
        let a = ArtifactCipher::from_hex(&key).expect("valid key");
        let b = ArtifactCipher::from_key(&[0u8; KEY_SIZE]).expect("valid key");
        let sealed = a.encrypt(b"x").expect("encrypt should work");
        assert_eq!(b.decrypt(&sealed).expect("decrypt should work"), b"x");

        assert!(matches!(
            ArtifactCipher::from_hex("abcd"),
            Err(CryptoError::InvalidKeyLength(2))
        ));
        assert!(ArtifactCipher::from_hex("zz").is_err());
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(sha256_hex(b"abc").len(), 64);
    }
}
