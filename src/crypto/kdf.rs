//! Key Derivation Functions
//!
//! A shared secret is stretched with PBKDF2-HMAC-SHA256 and the result is
//! expanded with HKDF-SHA256 into one key per direction.

use super::{CryptoError, Role, KEY_LEN};
use ring::hkdf::{self, Salt, HKDF_SHA256};
use ring::pbkdf2;
use std::num::NonZeroU32;

/// Default PBKDF2 iteration count
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 100_000;

const PBKDF2_SALT: &[u8] = b"otunnel link secret v1";
const INITIATOR_LABEL: &[u8] = b"otunnel initiator to responder";
const RESPONDER_LABEL: &[u8] = b"otunnel responder to initiator";

/// HKDF-SHA256 key derivation
pub struct Hkdf {
    prk: hkdf::Prk,
}

impl Hkdf {
    /// Create HKDF from input keying material
    ///
    /// # Arguments
    /// * `salt` - Optional salt (if None, uses zeros)
    /// * `ikm` - Input keying material
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let salt = match salt {
            Some(s) => Salt::new(HKDF_SHA256, s),
            None => Salt::new(HKDF_SHA256, &[0u8; 32]),
        };
        Self {
            prk: salt.extract(ikm),
        }
    }

    /// Derive a 32-byte key for `info`
    pub fn expand_key(&self, info: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        let info_refs = [info];
        let okm = self
            .prk
            .expand(&info_refs, HkdfLen(KEY_LEN))
            .map_err(|_| CryptoError::KeyDerivation("HKDF expand failed".to_string()))?;

        let mut key = [0u8; KEY_LEN];
        okm.fill(&mut key)
            .map_err(|_| CryptoError::KeyDerivation("HKDF fill failed".to_string()))?;
        Ok(key)
    }
}

/// Helper struct for HKDF output length
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Stretch a shared secret with PBKDF2-HMAC-SHA256
pub fn stretch_secret(secret: &[u8], iterations: u32) -> Result<[u8; KEY_LEN], CryptoError> {
    if secret.is_empty() {
        return Err(CryptoError::EmptySecret);
    }
    let iterations = NonZeroU32::new(iterations)
        .ok_or_else(|| CryptoError::KeyDerivation("zero PBKDF2 iterations".to_string()))?;

    let mut out = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        PBKDF2_SALT,
        secret,
        &mut out,
    );
    Ok(out)
}

/// One key per direction of a link connection
#[derive(Clone)]
pub struct LinkKeys {
    pub initiator_to_responder: [u8; KEY_LEN],
    pub responder_to_initiator: [u8; KEY_LEN],
}

impl LinkKeys {
    /// `(sealing key, opening key)` for the given side
    pub fn for_role(&self, role: Role) -> (&[u8; KEY_LEN], &[u8; KEY_LEN]) {
        match role {
            Role::Initiator => (&self.initiator_to_responder, &self.responder_to_initiator),
            Role::Responder => (&self.responder_to_initiator, &self.initiator_to_responder),
        }
    }
}

/// Derive both direction keys from a shared secret
pub fn derive_link_keys(secret: &[u8], iterations: u32) -> Result<LinkKeys, CryptoError> {
    let stretched = stretch_secret(secret, iterations)?;
    let hkdf = Hkdf::new(None, &stretched);

    Ok(LinkKeys {
        initiator_to_responder: hkdf.expand_key(INITIATOR_LABEL)?,
        responder_to_initiator: hkdf.expand_key(RESPONDER_LABEL)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_labels() {
        let hkdf = Hkdf::new(Some(b"salt"), b"input keying material");

        let key1 = hkdf.expand_key(b"label1").unwrap();
        let key2 = hkdf.expand_key(b"label2").unwrap();
        assert_ne!(key1, key2);
        assert_eq!(key1, hkdf.expand_key(b"label1").unwrap());
    }

    #[test]
    fn test_link_keys_mirror_between_roles() {
        let keys = derive_link_keys(b"s3cret", 10).unwrap();
        assert_ne!(keys.initiator_to_responder, keys.responder_to_initiator);

        let (client_seal, client_open) = keys.for_role(Role::Initiator);
        let (server_seal, server_open) = keys.for_role(Role::Responder);
        assert_eq!(client_seal, server_open);
        assert_eq!(client_open, server_seal);
    }

    #[test]
    fn test_different_secrets_differ() {
        let a = derive_link_keys(b"one", 10).unwrap();
        let b = derive_link_keys(b"two", 10).unwrap();
        assert_ne!(a.initiator_to_responder, b.initiator_to_responder);
    }

    #[test]
    fn test_rejects_empty_secret_and_zero_iterations() {
        assert!(matches!(stretch_secret(b"", 10), Err(CryptoError::EmptySecret)));
        assert!(stretch_secret(b"x", 0).is_err());
    }
}
