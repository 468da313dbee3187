//! Encryption adapter for message bodies.
//!
//! ChaCha20-Poly1305 with a fresh random 96-bit nonce per call, in the same shape
//! the media and sync layers elsewhere in the stack use. The adapter keeps no key
//! state: every call receives the key it should use, and key lifecycle belongs to
//! whoever supplies them.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use parley_protocol::{EncryptionMeta, Envelope};

pub mod key;
pub mod nonce;

pub use key::{SymmetricKey, KEY_LEN};
pub use nonce::CounterNonces;

/// Algorithm identifier carried in `encryption.alg`.
pub const ALGORITHM: &str = "chacha20poly1305";

pub const NONCE_LEN: usize = 12;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("ciphertext failed authentication")]
    AuthenticationFailed,

    #[error("nonce space exhausted for this key")]
    KeyExhausted,

    #[error("unsupported encryption algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid nonce length: expected 12 bytes, got {0}")]
    InvalidNonce(usize),

    #[error("ciphertext is not valid base64")]
    InvalidEncoding,

    #[error("envelope is not encrypted")]
    NotEncrypted,

    #[error("encryption failed")]
    EncryptionFailed,
}

/// Ciphertext (with the Poly1305 tag appended) and the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

impl Sealed {
    pub fn meta(&self) -> EncryptionMeta {
        EncryptionMeta {
            alg: ALGORITHM.to_string(),
            nonce: self.nonce.to_vec(),
        }
    }
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt under a freshly generated random nonce.
pub fn encrypt(plaintext: &[u8], key: &SymmetricKey) -> CryptoResult<Sealed> {
    seal_with_nonce(plaintext, key, generate_nonce())
}

/// Encrypt under the next nonce of a deterministic sequence.
pub fn encrypt_with(
    plaintext: &[u8],
    key: &SymmetricKey,
    nonces: &mut CounterNonces,
) -> CryptoResult<Sealed> {
    let nonce = nonces.next_nonce()?;
    seal_with_nonce(plaintext, key, nonce)
}

pub fn decrypt(ciphertext: &[u8], nonce: &[u8], key: &SymmetricKey) -> CryptoResult<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::InvalidNonce(nonce.len()));
    }

    cipher(key)
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Replace a plaintext envelope body with base64 ciphertext and attach the metadata.
pub fn seal_envelope(envelope: Envelope, key: &SymmetricKey) -> CryptoResult<Envelope> {
    let sealed = encrypt(envelope.content.as_bytes(), key)?;
    let meta = sealed.meta();

    Ok(Envelope {
        content: STANDARD.encode(&sealed.ciphertext),
        ..envelope
    }
    .with_encryption(meta))
}

/// Verify and decrypt an encrypted envelope body.
pub fn open_envelope(envelope: &Envelope, key: &SymmetricKey) -> CryptoResult<Vec<u8>> {
    let meta = envelope
        .encryption
        .as_ref()
        .ok_or(CryptoError::NotEncrypted)?;

    if meta.alg != ALGORITHM {
        return Err(CryptoError::UnsupportedAlgorithm(meta.alg.clone()));
    }

    let ciphertext = STANDARD
        .decode(envelope.content.as_bytes())
        .map_err(|_| CryptoError::InvalidEncoding)?;

    decrypt(&ciphertext, &meta.nonce, key)
}

fn seal_with_nonce(
    plaintext: &[u8],
    key: &SymmetricKey,
    nonce: [u8; NONCE_LEN],
) -> CryptoResult<Sealed> {
    let ciphertext = cipher(key)
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(Sealed { ciphertext, nonce })
}

fn cipher(key: &SymmetricKey) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()))
}
