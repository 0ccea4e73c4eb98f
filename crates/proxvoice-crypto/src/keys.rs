//! Server key material.
//!
//! The server holds one AES key. Every session gets its own key derived from
//! it and the session secret, so a key handed to one client is useless for
//! any other session.

use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::cipher::{EncryptionError, KEY_LEN};

/// The server-wide AES key. Replaced wholesale on reload, never mutated.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerKey(Zeroizing<Vec<u8>>);

impl ServerKey {
    /// A fresh random key: the 16 bytes of a v4 UUID.
    pub fn generate() -> Self {
        Self(Zeroizing::new(Uuid::new_v4().as_bytes().to_vec()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EncryptionError> {
        if bytes.len() != KEY_LEN {
            return Err(EncryptionError::InvalidKeyLength {
                expected: KEY_LEN,
                got: bytes.len(),
            });
        }
        Ok(Self(Zeroizing::new(bytes.to_vec())))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Derive the key for the session identified by `secret`.
    pub fn derive_session_key(&self, secret: &Uuid) -> Result<SessionKey, EncryptionError> {
        let hk = Hkdf::<Sha256>::new(Some(secret.as_bytes()), &self.0);
        let mut okm = Zeroizing::new(vec![0u8; KEY_LEN]);
        hk.expand(b"proxvoice session key", &mut okm)
            .map_err(|_| EncryptionError::KeyDerivation)?;
        Ok(SessionKey(okm))
    }
}

impl fmt::Debug for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServerKey(..)")
    }
}

/// Key material for one session's cipher.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey(Zeroizing<Vec<u8>>);

impl SessionKey {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(Zeroizing::new(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}
