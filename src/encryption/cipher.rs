//! AES-256-GCM primitives for repository data.

use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::encryption::error::{EncryptionStorageError, EncryptionStorageResult};

/// Size of a data encryption key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of a GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of a GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// A repository's data encryption key.
///
/// Zeroized on drop and redacted from `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Dek {
    bytes: [u8; KEY_SIZE],
}

impl Dek {
    /// Generates a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> EncryptionStorageResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(EncryptionStorageError::InvalidKeySize {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    /// Returns the key bytes. Never log or serialize the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(GenericArray::from_slice(&self.bytes))
    }

    /// Encrypts with a caller-supplied nonce.
    ///
    /// Deterministic for a given nonce, which is what lets the physical key of
    /// a record be re-derived from the nonce kept in its metadata record.
    pub fn encrypt_with_nonce(&self, nonce: &[u8], plaintext: &[u8]) -> EncryptionStorageResult<Vec<u8>> {
        if nonce.len() != NONCE_SIZE {
            return Err(EncryptionStorageError::Cipher(format!(
                "invalid nonce size: {}",
                nonce.len()
            )));
        }
        self.cipher()
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|_| EncryptionStorageError::Cipher("encryption error".to_string()))
    }

    /// Decrypts data produced by [`encrypt_with_nonce`](Self::encrypt_with_nonce).
    pub fn decrypt_with_nonce(&self, nonce: &[u8], ciphertext: &[u8]) -> EncryptionStorageResult<Vec<u8>> {
        if nonce.len() != NONCE_SIZE {
            return Err(EncryptionStorageError::Cipher(format!(
                "invalid nonce size: {}",
                nonce.len()
            )));
        }
        self.cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| EncryptionStorageError::Cipher("decryption error".to_string()))
    }

    /// Encrypts with a fresh nonce.
    ///
    /// The output format is: `nonce (12 bytes) || ciphertext || tag (16 bytes)`
    pub fn seal(&self, plaintext: &[u8]) -> EncryptionStorageResult<Vec<u8>> {
        let nonce = generate_nonce();
        let ciphertext = self.encrypt_with_nonce(&nonce, plaintext)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend(ciphertext);
        Ok(sealed)
    }

    /// Decrypts data produced by [`seal`](Self::seal).
    pub fn open(&self, sealed: &[u8]) -> EncryptionStorageResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(EncryptionStorageError::Cipher("ciphertext too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.decrypt_with_nonce(nonce, ciphertext)
    }
}

impl std::fmt::Debug for Dek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dek").field("bytes", &"[REDACTED]").finish()
    }
}

/// Generates a random GCM nonce.
pub(crate) fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}
