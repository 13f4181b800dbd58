//! AES-256-GCM string encryption with a 16-byte random IV.
//!
//! This module provides:
//! - [`encrypt`]: encrypt plaintext with a fresh IV, returning an [`EncryptedBlob`]
//! - [`decrypt`]: authenticate and decrypt an [`EncryptedBlob`] into a [`SecretBuffer`]
//! - [`EncryptedBlob`]: IV + ciphertext container with the dotted wire format
//!
//! # Wire format
//!
//! ```text
//! <base64 IV (16 bytes)> "." <base64 ciphertext || tag>
//! ```
//!
//! Exactly one `.` separates the two parts. Standard base64 never emits
//! a `.`, so the separator is unambiguous.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::memory::SecretBuffer;

/// IV length in bytes (128 bits).
pub const IV_LEN: usize = 16;

/// AES-256 key length in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// GCM authentication tag length in bytes, appended to the ciphertext.
pub const TAG_LEN: usize = 16;

/// Separator between the IV and ciphertext parts of the wire format.
pub const BLOB_SEPARATOR: char = '.';

/// AES-256-GCM instantiated with a 128-bit nonce.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Authenticated ciphertext container: IV + (ciphertext || tag).
#[must_use = "encrypted data must be stored or transmitted"]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedBlob {
    /// 128-bit random IV, unique per encryption.
    pub iv: [u8; IV_LEN],
    /// Encrypted bytes followed by the 16-byte GCM tag.
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    /// Render the wire format `base64(iv) "." base64(ciphertext)`.
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{}{BLOB_SEPARATOR}{}",
            STANDARD.encode(self.iv),
            STANDARD.encode(&self.ciphertext)
        )
    }

    /// Parse the wire format.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::MalformedBlob` if the input does not split into
    /// exactly two dot-delimited parts, either part is not valid base64, the
    /// IV is not 16 bytes, or the ciphertext is shorter than a GCM tag.
    pub fn parse(encoded: &str) -> Result<Self, CryptoError> {
        let mut parts = encoded.split(BLOB_SEPARATOR);
        let (Some(iv_part), Some(ct_part), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(CryptoError::MalformedBlob(
                "expected exactly two dot-delimited parts".into(),
            ));
        };

        let iv_bytes = STANDARD
            .decode(iv_part)
            .map_err(|e| CryptoError::MalformedBlob(format!("invalid IV encoding: {e}")))?;
        let iv: [u8; IV_LEN] = iv_bytes.as_slice().try_into().map_err(|_| {
            CryptoError::MalformedBlob(format!(
                "invalid IV length: {} bytes (expected {IV_LEN})",
                iv_bytes.len()
            ))
        })?;

        let ciphertext = STANDARD
            .decode(ct_part)
            .map_err(|e| CryptoError::MalformedBlob(format!("invalid ciphertext encoding: {e}")))?;
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::MalformedBlob(format!(
                "ciphertext too short: {} bytes (minimum {TAG_LEN})",
                ciphertext.len()
            )));
        }

        Ok(Self { iv, ciphertext })
    }
}

// ---------------------------------------------------------------------------
// Core encryption
// ---------------------------------------------------------------------------

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm16, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyMaterial(format!(
            "invalid key length: {} bytes (expected {KEY_LEN})",
            key.len()
        )));
    }
    Aes256Gcm16::new_from_slice(key)
        .map_err(|_| CryptoError::Encryption("failed to create AES-256-GCM key".into()))
}

/// Encrypt `plaintext` under a 256-bit `key` with a fresh random 16-byte IV.
///
/// `aad` is authenticated but not encrypted; it must be supplied again,
/// byte for byte, to [`decrypt`].
///
/// # Errors
///
/// Returns `CryptoError::InvalidKeyMaterial` if the key is not exactly 32
/// bytes, `CryptoError::Encryption` if the underlying seal fails.
pub fn encrypt(plaintext: &[u8], key: &[u8], aad: &[u8]) -> Result<EncryptedBlob, CryptoError> {
    let cipher = cipher_for(key)?;

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(
            Nonce::<U16>::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encryption("AES-256-GCM encryption failed".into()))?;

    Ok(EncryptedBlob { iv, ciphertext })
}

/// Decrypt and authenticate an [`EncryptedBlob`].
///
/// Returns the plaintext as a [`SecretBuffer`] (zeroized on drop).
///
/// # Errors
///
/// Returns `CryptoError::InvalidKeyMaterial` if the key is not exactly 32
/// bytes. Returns `CryptoError::DecryptionFailed` on any cipher failure
/// (wrong key, wrong AAD, corrupted IV, ciphertext or tag).
pub fn decrypt(blob: &EncryptedBlob, key: &[u8], aad: &[u8]) -> Result<SecretBuffer, CryptoError> {
    let cipher = cipher_for(key)?;

    let mut plaintext = cipher
        .decrypt(
            Nonce::<U16>::from_slice(&blob.iv),
            Payload {
                msg: &blob.ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let result = SecretBuffer::new(&plaintext);
    plaintext.zeroize();
    Ok(result)
}

/// Encrypt a UTF-8 string and render the wire format in one step.
///
/// # Errors
///
/// See [`encrypt`].
pub fn encrypt_str(plaintext: &str, key: &[u8], aad: &[u8]) -> Result<String, CryptoError> {
    encrypt(plaintext.as_bytes(), key, aad).map(|blob| blob.encode())
}

/// Parse the wire format and decrypt in one step.
///
/// # Errors
///
/// `CryptoError::MalformedBlob` for a bad wire format, otherwise see [`decrypt`].
pub fn decrypt_str(encoded: &str, key: &[u8], aad: &[u8]) -> Result<SecretBuffer, CryptoError> {
    let blob = EncryptedBlob::parse(encoded)?;
    decrypt(&blob, key, aad)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
