//! Cryptographic error types for `wardkey-crypto-core`.

use thiserror::Error;

/// Errors produced by cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encrypted blob is not `<base64 IV>.<base64 ciphertext>` with a 16-byte IV.
    #[error("malformed encrypted blob: {0}")]
    MalformedBlob(String),

    /// Authentication tag verification failed: ciphertext tampered or wrong key.
    #[error("decryption failed: authentication tag mismatch")]
    DecryptionFailed,

    /// Symmetric encryption failure (AES-256-GCM setup or seal).
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Invalid key material (wrong length, corrupted encoding).
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// PIN hashing failed (Argon2id parameter validation, memory allocation).
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Secure buffer allocation or CSPRNG failure.
    #[error("secure memory error: {0}")]
    SecureMemory(String),
}
