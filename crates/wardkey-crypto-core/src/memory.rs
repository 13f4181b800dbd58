//! Secret-holding buffers for key material and decrypted plaintext.
//!
//! [`SecretBuffer`] wraps [`SecretSlice<u8>`] from `secrecy`: bytes are
//! zeroized on drop and never printed by `Debug`/`Display`.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretSlice};
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Variable-length buffer for sensitive data.
pub struct SecretBuffer {
    inner: SecretSlice<u8>,
}

impl SecretBuffer {
    /// Copy `data` into a new secret allocation.
    ///
    /// The caller should zeroize the source data after calling this.
    #[must_use]
    pub fn new(data: &[u8]) -> Self {
        Self {
            inner: data.to_vec().into(),
        }
    }

    /// Take ownership of `data` without copying.
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { inner: data.into() }
    }

    /// Create a `SecretBuffer` filled with cryptographically random bytes.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::SecureMemory` if the CSPRNG fails.
    pub fn random(len: usize) -> Result<Self, CryptoError> {
        let mut bytes = vec![0u8; len];
        if let Err(e) = OsRng.try_fill_bytes(&mut bytes) {
            bytes.zeroize();
            return Err(CryptoError::SecureMemory(format!("CSPRNG fill failed: {e}")));
        }
        Ok(Self::from_vec(bytes))
    }

    /// Expose the underlying bytes. Keep the borrow short.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        self.inner.expose_secret()
    }

    /// Interpret the contents as UTF-8.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` when the bytes are not valid
    /// UTF-8 (a plaintext that was never a string cannot be a valid result).
    pub fn expose_str(&self) -> Result<&str, CryptoError> {
        std::str::from_utf8(self.expose()).map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Returns the number of bytes in the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.expose().len()
    }

    /// Returns `true` if the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Clone for SecretBuffer {
    fn clone(&self) -> Self {
        Self::new(self.expose())
    }
}

impl fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBuffer(***)")
    }
}

impl fmt::Display for SecretBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBuffer(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_copies_input() {
        let buf = SecretBuffer::new(b"key material");
        assert_eq!(buf.expose(), b"key material");
        assert_eq!(buf.len(), 12);
        assert!(!buf.is_empty());
    }

    #[test]
    fn random_has_requested_length() {
        let buf = SecretBuffer::random(32).unwrap();
        assert_eq!(buf.len(), 32);
    }

    #[test]
    fn random_buffers_differ() {
        let a = SecretBuffer::random(32).unwrap();
        let b = SecretBuffer::random(32).unwrap();
        assert_ne!(a.expose(), b.expose());
    }

    #[test]
    fn debug_and_display_are_masked() {
        let buf = SecretBuffer::new(b"hunter2");
        assert_eq!(format!("{buf:?}"), "SecretBuffer(***)");
        assert_eq!(format!("{buf}"), "SecretBuffer(***)");
    }

    #[test]
    fn expose_str_rejects_invalid_utf8() {
        let buf = SecretBuffer::new(&[0xFF, 0xFE]);
        assert!(matches!(buf.expose_str(), Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn empty_buffer() {
        let buf = SecretBuffer::new(&[]);
        assert!(buf.is_empty());
    }
}
