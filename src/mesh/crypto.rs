//! Optional AEAD layer for mesh payloads.
//!
//! Disabled by default, in which case encrypt/decrypt are strict
//! passthroughs. When enabled, payloads are sealed with AES-256-GCM using a
//! random 96-bit nonce and associated data binding
//! `origin_id || dest_id || seqno` to the ciphertext, so a frame cannot be
//! replayed under different addressing.
//!
//! Note: on amateur radio allocations content encryption is typically not
//! permitted; keep this disabled there.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption key must be {KEY_LEN} bytes, got {0}")]
    BadKeyLength(usize),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed (wrong key or tampered frame)")]
    Decrypt,
}

/// Seals and opens mesh payloads; a no-op when no key is configured.
pub struct PayloadCipher {
    cipher: Option<Aes256Gcm>,
}

impl PayloadCipher {
    /// Passthrough cipher (encryption disabled).
    pub fn disabled() -> Self {
        Self { cipher: None }
    }

    /// Cipher with a 32-byte AES-256-GCM key.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::BadKeyLength(key.len()))?;
        Ok(Self {
            cipher: Some(cipher),
        })
    }

    pub fn enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// Returns `(nonce, ciphertext)`. When disabled: `(empty, plaintext)`.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let Some(cipher) = &self.cipher else {
            return Ok((Vec::new(), plaintext.to_vec()));
        };
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: associated_data,
                },
            )
            .map_err(|_| CryptoError::Encrypt)?;
        Ok((nonce.to_vec(), ciphertext))
    }

    /// Returns the plaintext. When disabled: the ciphertext unchanged.
    pub fn decrypt(
        &self,
        nonce: &[u8],
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let Some(cipher) = &self.cipher else {
            return Ok(ciphertext.to_vec());
        };
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: associated_data,
                },
            )
            .map_err(|_| CryptoError::Decrypt)
    }
}
