//! Cipher handles for UDP media payloads.
//!
//! Both algorithms prepend a random IV/nonce to every ciphertext so a handle
//! can be shared by the receive loop and any number of senders without
//! per-packet coordination.

use std::sync::Arc;

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

/// Block cipher in CBC mode with PKCS#5/7 padding.
pub const AES_CBC: &str = "AES/CBC/PKCS5Padding";

/// AES in Galois/Counter mode.
pub const AES_GCM: &str = "AES/GCM/NoPadding";

pub const DEFAULT_ALGORITHM: &str = AES_CBC;

/// Both algorithms use AES-128.
pub const KEY_LEN: usize = 16;

const BLOCK_LEN: usize = 16;
const IV_LEN: usize = 16;

/// HMAC-SHA256 truncated to 128 bits.
pub const CBC_TAG_LEN: usize = 16;

pub const GCM_TAG_LEN: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("unsupported encryption algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("ciphertext too short or misaligned: {0} bytes")]
    Truncated(usize),

    #[error("authentication failed: wrong key or tampered data")]
    Authentication,

    #[error("invalid padding")]
    Padding,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("encryption failed")]
    Seal,
}

/// A keyed cipher. `decrypt` never panics on malformed input.
pub trait Encryption: Send + Sync {
    /// The algorithm identifier this handle was created with.
    fn algorithm(&self) -> &'static str;

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError>;
}

/// Create a cipher handle for `algorithm` keyed with `key`.
pub fn create(algorithm: &str, key: &[u8]) -> Result<Arc<dyn Encryption>, EncryptionError> {
    match algorithm {
        AES_CBC => Ok(Arc::new(AesCbc::new(key)?)),
        AES_GCM => Ok(Arc::new(AesGcm::new(key)?)),
        other => Err(EncryptionError::UnsupportedAlgorithm(other.to_string())),
    }
}

fn check_key(key: &[u8]) -> Result<(), EncryptionError> {
    if key.len() != KEY_LEN {
        return Err(EncryptionError::InvalidKeyLength {
            expected: KEY_LEN,
            got: key.len(),
        });
    }
    Ok(())
}

/// AES-128-CBC with an encrypt-then-MAC tag.
///
/// Layout: `iv(16) || ciphertext(16*n) || hmac(16)`. Without the tag a
/// wrong key would usually surface as a padding error, but occasionally as
/// garbage plaintext; the tag turns every wrong-key case into an error.
pub struct AesCbc {
    enc_key: Zeroizing<[u8; KEY_LEN]>,
    mac_key: Zeroizing<[u8; 32]>,
}

impl AesCbc {
    pub fn new(key: &[u8]) -> Result<Self, EncryptionError> {
        check_key(key)?;
        let hk = Hkdf::<Sha256>::new(None, key);
        let mut enc_key = Zeroizing::new([0u8; KEY_LEN]);
        let mut mac_key = Zeroizing::new([0u8; 32]);
        hk.expand(b"proxvoice aes-cbc enc", enc_key.as_mut())
            .map_err(|_| EncryptionError::KeyDerivation)?;
        hk.expand(b"proxvoice aes-cbc mac", mac_key.as_mut())
            .map_err(|_| EncryptionError::KeyDerivation)?;
        Ok(Self { enc_key, mac_key })
    }

    fn mac(&self) -> Result<HmacSha256, EncryptionError> {
        <HmacSha256 as Mac>::new_from_slice(self.mac_key.as_ref())
            .map_err(|_| EncryptionError::KeyDerivation)
    }
}

impl Encryption for AesCbc {
    fn algorithm(&self) -> &'static str {
        AES_CBC
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let encryptor = Aes128CbcEnc::new_from_slices(self.enc_key.as_ref(), &iv)
            .map_err(|_| EncryptionError::Seal)?;
        let body = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut out = Vec::with_capacity(IV_LEN + body.len() + CBC_TAG_LEN);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&body);

        let mut mac = self.mac()?;
        mac.update(&out);
        let tag = mac.finalize().into_bytes();
        out.extend_from_slice(&tag[..CBC_TAG_LEN]);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let len = ciphertext.len();
        if len < IV_LEN + BLOCK_LEN + CBC_TAG_LEN || (len - IV_LEN - CBC_TAG_LEN) % BLOCK_LEN != 0 {
            return Err(EncryptionError::Truncated(len));
        }

        let (authenticated, tag) = ciphertext.split_at(len - CBC_TAG_LEN);
        let mut mac = self.mac()?;
        mac.update(authenticated);
        mac.verify_truncated_left(tag)
            .map_err(|_| EncryptionError::Authentication)?;

        let (iv, body) = authenticated.split_at(IV_LEN);
        let decryptor = Aes128CbcDec::new_from_slices(self.enc_key.as_ref(), iv)
            .map_err(|_| EncryptionError::Truncated(len))?;
        decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(body)
            .map_err(|_| EncryptionError::Padding)
    }
}

/// AES-128-GCM. Layout: `nonce(12) || ciphertext || tag(16)`.
pub struct AesGcm {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl AesGcm {
    pub fn new(key: &[u8]) -> Result<Self, EncryptionError> {
        check_key(key)?;
        let unbound = UnboundKey::new(&AES_128_GCM, key).map_err(|_| EncryptionError::InvalidKeyLength {
            expected: KEY_LEN,
            got: key.len(),
        })?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }
}

impl Encryption for AesGcm {
    fn algorithm(&self) -> &'static str {
        AES_GCM
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| EncryptionError::Seal)?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce_bytes), Aad::empty(), &mut in_out)
            .map_err(|_| EncryptionError::Seal)?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if ciphertext.len() < NONCE_LEN + GCM_TAG_LEN {
            return Err(EncryptionError::Truncated(ciphertext.len()));
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&ciphertext[..NONCE_LEN]);

        let mut in_out = ciphertext[NONCE_LEN..].to_vec();
        let plaintext = self
            .key
            .open_in_place(Nonce::assume_unique_for_key(nonce_bytes), Aad::empty(), &mut in_out)
            .map_err(|_| EncryptionError::Authentication)?;
        Ok(plaintext.to_vec())
    }
}
