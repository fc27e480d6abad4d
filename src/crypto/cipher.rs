//! ChaCha20-Poly1305 AEAD encryption
//!
//! Two flavours are exposed. Channel traffic uses [`Cipher::seal`] with a
//! nonce derived from the message sequence number, so the nonce never
//! travels on the wire. Storage uses [`Cipher::seal_random`], which prepends
//! a random nonce to the output.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};

use super::error::{CryptoError, CryptoResult};

/// Size of the encryption key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Symmetric cipher for encryption/decryption
pub struct Cipher;

impl Cipher {
    /// Build a nonce from a 64-bit counter.
    ///
    /// The top four bytes are zero. A (key, counter) pair must never be
    /// sealed twice.
    pub fn counter_nonce(counter: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    /// Encrypt with an explicit nonce and associated data.
    ///
    /// Returns `ciphertext || tag`; the nonce is not included.
    pub fn seal(
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
        aad: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(key.into());
        cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt output of [`Cipher::seal`]
    pub fn open(
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let cipher = ChaCha20Poly1305::new(key.into());
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Encrypt under a fresh random nonce.
    ///
    /// Returns: nonce || ciphertext || tag
    pub fn seal_random(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> CryptoResult<Vec<u8>> {
        let nonce: [u8; NONCE_SIZE] = super::try_random_bytes()?;
        let sealed = Self::seal(key, &nonce, plaintext, aad)?;

        let mut result = Vec::with_capacity(NONCE_SIZE + sealed.len());
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&sealed);
        Ok(result)
    }

    /// Decrypt output of [`Cipher::seal_random`]
    pub fn open_random(key: &[u8; KEY_SIZE], data: &[u8], aad: &[u8]) -> CryptoResult<Vec<u8>> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&data[..NONCE_SIZE]);
        Self::open(key, &nonce, &data[NONCE_SIZE..], aad)
    }
}
