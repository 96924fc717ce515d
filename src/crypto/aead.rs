//! AEAD encryption/decryption
//!
//! One [`Cipher`] protects one direction of a connection. Nonces are a
//! 64-bit message counter in the last 8 bytes, incremented per message, so
//! the sealing and the opening side stay in step without sending them.

use super::{CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};

/// ChaCha20-Poly1305 with a per-direction message counter
pub struct Cipher {
    key: LessSafeKey,
    nonce_counter: u64,
}

impl Cipher {
    /// Create a new cipher from a 32-byte key
    pub fn new(key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound_key =
            UnboundKey::new(&CHACHA20_POLY1305, key).map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
            nonce_counter: 0,
        })
    }

    /// Encrypt one message, returning ciphertext with the tag appended
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Nonce::assume_unique_for_key(self.next_nonce()?);
        let mut buffer = Vec::with_capacity(plaintext.len() + TAG_LEN);
        buffer.extend_from_slice(plaintext);

        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| CryptoError::Encryption)?;
        Ok(buffer)
    }

    /// Decrypt the next message of this direction, verifying its tag
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::AuthenticationFailed);
        }
        let nonce = Nonce::assume_unique_for_key(self.next_nonce()?);
        let mut buffer = ciphertext.to_vec();

        let len = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| CryptoError::AuthenticationFailed)?
            .len();
        buffer.truncate(len);
        Ok(buffer)
    }

    fn next_nonce(&mut self) -> Result<[u8; NONCE_LEN], CryptoError> {
        if self.nonce_counter == u64::MAX {
            return Err(CryptoError::NonceExhausted);
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce[4..12].copy_from_slice(&self.nonce_counter.to_le_bytes());
        self.nonce_counter += 1;
        Ok(nonce)
    }

    /// Messages processed so far
    pub fn nonce_counter(&self) -> u64 {
        self.nonce_counter
    }
}
