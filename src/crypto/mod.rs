//! Cryptographic primitives for enciphered framing
//!
//! This module provides:
//! - ChaCha20-Poly1305 AEAD with implicit counter nonces
//! - PBKDF2-HMAC-SHA256 stretching of a shared secret
//! - HKDF-SHA256 expansion into per-direction link keys

mod aead;
mod kdf;

pub use aead::Cipher;
pub use kdf::{derive_link_keys, stretch_secret, Hkdf, LinkKeys, DEFAULT_PBKDF2_ITERATIONS};

use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed")]
    Encryption,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Nonce space exhausted")]
    NonceExhausted,

    #[error("Empty secret")]
    EmptySecret,
}

/// Which end of the connection a key schedule is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The dialing side
    Initiator,
    /// The accepting side
    Responder,
}
