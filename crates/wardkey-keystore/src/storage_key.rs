//! Typed secure-store key namespace.
//!
//! Every value this crate persists is addressed through [`StorageKey`];
//! the string form is produced only at the store boundary via `Display`
//! and read back with [`StorageKey::parse`] when scanning `read_all()`.
//!
//! User ids and sealed-value names are restricted to ASCII letters,
//! digits and `- . @ +` so that no identifier can contain the `_`
//! separator and forge a neighbouring key (`pin_` + `salt_bob`).

use std::fmt;

use crate::error::KeystoreError;

/// Unversioned HMAC master key name written by older stores. Read as
/// version 1; never written.
pub const LEGACY_HMAC_MASTER_KEY: &str = "hmac_master_key";

/// Maximum identifier length accepted in a storage key.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// The three independent key roles, each versioned separately.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyRole {
    /// HMAC master key for integrity tags.
    Hmac,
    /// General-purpose encryption key (API and refresh tokens).
    Encryption,
    /// Encryption key reserved for payment data.
    PaymentEncryption,
}

impl KeyRole {
    /// All roles, in the order rotation allocates them.
    pub const ALL: [Self; 3] = [Self::Hmac, Self::Encryption, Self::PaymentEncryption];

    /// Storage key holding this role's material for `version`.
    #[must_use]
    pub const fn key(self, version: u32) -> StorageKey {
        match self {
            Self::Hmac => StorageKey::HmacMasterKey(version),
            Self::Encryption => StorageKey::EncryptionKey(version),
            Self::PaymentEncryption => StorageKey::PaymentEncryptionKey(version),
        }
    }

    /// Stable lowercase name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hmac => "hmac",
            Self::Encryption => "encryption",
            Self::PaymentEncryption => "payment_encryption",
        }
    }
}

/// A key in the secure store.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StorageKey {
    /// `hmac_master_key_v{n}`. The unversioned `hmac_master_key` of older
    /// stores parses as version 1.
    HmacMasterKey(u32),
    /// `encryption_key_v{n}`.
    EncryptionKey(u32),
    /// `payment_encryption_key_v{n}`.
    PaymentEncryptionKey(u32),
    /// `pin_{user}`: base64 Argon2id hash.
    Pin(String),
    /// `pin_salt_{user}`.
    PinSalt(String),
    /// `pin_hmac_{user}`: versioned integrity tag over hash + salt.
    PinHmac(String),
    /// `pin_created_{user}`: Unix millis.
    PinCreated(String),
    /// `verification_code_{user}`.
    VerificationCode(String),
    /// `verification_code_expiry_{user}`: Unix millis.
    VerificationCodeExpiry(String),
    /// `verification_code_hmac_{user}`.
    VerificationCodeHmac(String),
    /// `biometric_enabled_{user}`.
    BiometricEnabled(String),
    /// `last_key_rotation_timestamp`: Unix millis.
    LastKeyRotation,
    /// `current_key_version`.
    CurrentKeyVersion,
    /// `key_rotation_recovery_mode`: persisted rotation state.
    RotationRecoveryMode,
    /// `key_rotation_in_progress`: source version of an in-flight rotation.
    RotationInProgress,
    /// `sealed_{name}`: dependent secret under the encryption role.
    Sealed(String),
    /// `sealed_payment_{name}`: dependent secret under the payment role.
    SealedPayment(String),
    /// `key_backup_{stamp}_{original}`: emergency snapshot of key material.
    KeyBackup {
        /// Unix millis of the emergency recovery that took the snapshot.
        stamp: i64,
        /// The key material entry that was copied.
        original: Box<StorageKey>,
    },
}

impl StorageKey {
    /// `true` for per-version key material (any role, any version).
    #[must_use]
    pub const fn is_key_material(&self) -> bool {
        matches!(
            self,
            Self::HmacMasterKey(_) | Self::EncryptionKey(_) | Self::PaymentEncryptionKey(_)
        )
    }

    /// Role and version of a key material entry.
    #[must_use]
    pub const fn key_material(&self) -> Option<(KeyRole, u32)> {
        match *self {
            Self::HmacMasterKey(v) => Some((KeyRole::Hmac, v)),
            Self::EncryptionKey(v) => Some((KeyRole::Encryption, v)),
            Self::PaymentEncryptionKey(v) => Some((KeyRole::PaymentEncryption, v)),
            _ => None,
        }
    }

    /// Parse a store key back into its typed form.
    ///
    /// Returns `None` for strings outside this crate's namespace.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            LEGACY_HMAC_MASTER_KEY => return Some(Self::HmacMasterKey(1)),
            "last_key_rotation_timestamp" => return Some(Self::LastKeyRotation),
            "current_key_version" => return Some(Self::CurrentKeyVersion),
            "key_rotation_recovery_mode" => return Some(Self::RotationRecoveryMode),
            "key_rotation_in_progress" => return Some(Self::RotationInProgress),
            _ => {}
        }

        if let Some(rest) = raw.strip_prefix("key_backup_") {
            let (stamp, original) = rest.split_once('_')?;
            let stamp = stamp.parse().ok()?;
            let original = Self::parse(original).filter(Self::is_key_material)?;
            return Some(Self::KeyBackup {
                stamp,
                original: Box::new(original),
            });
        }

        // Versioned key material. Longest prefixes first.
        let versioned: [(&str, fn(u32) -> Self); 3] = [
            ("payment_encryption_key_v", Self::PaymentEncryptionKey),
            ("encryption_key_v", Self::EncryptionKey),
            ("hmac_master_key_v", Self::HmacMasterKey),
        ];
        for (prefix, make) in versioned {
            if let Some(v) = raw.strip_prefix(prefix) {
                return parse_version(v).map(make);
            }
        }

        // Identifier-scoped keys. Longest prefixes first.
        let scoped: [(&str, fn(String) -> Self); 10] = [
            ("verification_code_expiry_", Self::VerificationCodeExpiry),
            ("verification_code_hmac_", Self::VerificationCodeHmac),
            ("verification_code_", Self::VerificationCode),
            ("biometric_enabled_", Self::BiometricEnabled),
            ("sealed_payment_", Self::SealedPayment),
            ("sealed_", Self::Sealed),
            ("pin_created_", Self::PinCreated),
            ("pin_salt_", Self::PinSalt),
            ("pin_hmac_", Self::PinHmac),
            ("pin_", Self::Pin),
        ];
        for (prefix, make) in scoped {
            if let Some(id) = raw.strip_prefix(prefix) {
                return is_valid_identifier(id).then(|| make(id.to_owned()));
            }
        }

        None
    }
}

fn parse_version(raw: &str) -> Option<u32> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok().filter(|v| *v >= 1)
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HmacMasterKey(v) => write!(f, "hmac_master_key_v{v}"),
            Self::EncryptionKey(v) => write!(f, "encryption_key_v{v}"),
            Self::PaymentEncryptionKey(v) => write!(f, "payment_encryption_key_v{v}"),
            Self::Pin(u) => write!(f, "pin_{u}"),
            Self::PinSalt(u) => write!(f, "pin_salt_{u}"),
            Self::PinHmac(u) => write!(f, "pin_hmac_{u}"),
            Self::PinCreated(u) => write!(f, "pin_created_{u}"),
            Self::VerificationCode(u) => write!(f, "verification_code_{u}"),
            Self::VerificationCodeExpiry(u) => write!(f, "verification_code_expiry_{u}"),
            Self::VerificationCodeHmac(u) => write!(f, "verification_code_hmac_{u}"),
            Self::BiometricEnabled(u) => write!(f, "biometric_enabled_{u}"),
            Self::LastKeyRotation => f.write_str("last_key_rotation_timestamp"),
            Self::CurrentKeyVersion => f.write_str("current_key_version"),
            Self::RotationRecoveryMode => f.write_str("key_rotation_recovery_mode"),
            Self::RotationInProgress => f.write_str("key_rotation_in_progress"),
            Self::Sealed(n) => write!(f, "sealed_{n}"),
            Self::SealedPayment(n) => write!(f, "sealed_payment_{n}"),
            Self::KeyBackup { stamp, original } => write!(f, "key_backup_{stamp}_{original}"),
        }
    }
}

/// `true` if `id` may be embedded in a storage key.
#[must_use]
pub fn is_valid_identifier(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_IDENTIFIER_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'@' | b'+'))
}

/// Reject identifiers that cannot be embedded in a storage key.
///
/// # Errors
///
/// Returns [`KeystoreError::InvalidInput`] naming `what` on rejection.
pub fn validate_identifier(what: &str, id: &str) -> Result<(), KeystoreError> {
    if is_valid_identifier(id) {
        Ok(())
    } else {
        Err(KeystoreError::InvalidInput(format!(
            "{what} must be 1-{MAX_IDENTIFIER_LEN} characters of [A-Za-z0-9-.@+]"
        )))
    }
}
