//! Keystore error types for `wardkey-keystore`.

use thiserror::Error;
use wardkey_crypto_core::CryptoError;

/// Failures of the underlying secure key-value store.
///
/// Propagated to the caller as-is; this crate never retries storage.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The store could not be reached or refused the operation.
    #[error("secure store unavailable: {0}")]
    Unavailable(String),

    /// A stored value exists but cannot be interpreted.
    #[error("corrupt value at {key}: {reason}")]
    Corrupt {
        /// Storage key of the unreadable value.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// A failure inside a key rotation attempt.
#[derive(Debug, Clone, Error)]
pub enum RotationError {
    /// Rotation failed but the version pointer can be rolled back.
    #[error("recoverable rotation failure: {0}")]
    Recoverable(String),

    /// Rollback is impossible; emergency recovery is required.
    #[error("critical rotation failure: {0}")]
    Critical(String),
}

/// Emergency recovery itself failed. Nothing further is attempted
/// automatically; an operator has to intervene.
#[derive(Debug, Clone, Error)]
#[error("emergency key recovery failed during {step}: {reason}")]
pub struct EmergencyRecoveryError {
    /// The recovery step that failed (`snapshot`, `regenerate`, `reset_pointer`).
    pub step: &'static str,
    /// Underlying cause.
    pub reason: String,
}

/// Errors produced by keystore operations.
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// Cryptographic operation failed (delegated from crypto-core).
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Secure store failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// An HMAC over a stored secret did not verify.
    #[error("integrity check failed for {subject}")]
    Integrity {
        /// What was being verified (e.g. `pin`, `verification_code`).
        subject: String,
    },

    /// Rotation failed.
    #[error(transparent)]
    Rotation(#[from] RotationError),

    /// Emergency recovery failed. Fatal.
    #[error(transparent)]
    Emergency(#[from] EmergencyRecoveryError),

    /// Caller supplied an unusable argument.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl KeystoreError {
    /// `true` for failures that must reach an operator/alerting path.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Emergency(_))
    }
}
