//! Version-keyed string encryption, and sealed named secrets.
//!
//! [`CipherService::encrypt`]/[`CipherService::decrypt`] keep the bare
//! `<iv>.<ciphertext>` blob format: the caller is responsible for
//! remembering which key version a blob was encrypted under.
//!
//! Sealed values are stored by this service under `sealed_{name}` or
//! `sealed_payment_{name}` as
//!
//! ```text
//! v<version>:<base64 IV>.<base64 ciphertext>
//! ```
//!
//! so they always open under the version that sealed them, and rotation
//! can re-encrypt them without outside bookkeeping. The storage key is
//! bound as associated data: a sealed value copied under another name
//! fails to open.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use wardkey_crypto_core::{decrypt, encrypt, encrypt_str, CryptoError, EncryptedBlob, SecretBuffer};

use crate::error::KeystoreError;
use crate::keyring::KeyRing;
use crate::storage_key::{validate_identifier, KeyRole, StorageKey};
use crate::store::SecureStore;

/// Which key role protects a sealed value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SecretClass {
    /// API tokens, refresh tokens and similar.
    General,
    /// Payment data, under the payment encryption key.
    Payment,
}

impl SecretClass {
    /// Key role used for this class.
    #[must_use]
    pub const fn role(self) -> KeyRole {
        match self {
            Self::General => KeyRole::Encryption,
            Self::Payment => KeyRole::PaymentEncryption,
        }
    }

    /// Storage key for the value called `name`.
    #[must_use]
    pub fn storage_key(self, name: &str) -> StorageKey {
        match self {
            Self::General => StorageKey::Sealed(name.to_owned()),
            Self::Payment => StorageKey::SealedPayment(name.to_owned()),
        }
    }

    fn from_storage_key(key: &StorageKey) -> Option<(Self, &str)> {
        match key {
            StorageKey::Sealed(name) => Some((Self::General, name)),
            StorageKey::SealedPayment(name) => Some((Self::Payment, name)),
            _ => None,
        }
    }
}

/// A stored sealed value: key version plus encrypted blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedValue {
    /// Key version the blob was encrypted under.
    pub version: u32,
    /// Parsed blob.
    pub blob: EncryptedBlob,
}

impl fmt::Display for SealedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}:{}", self.version, self.blob.encode())
    }
}

impl FromStr for SealedValue {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (version, blob) = s
            .strip_prefix('v')
            .and_then(|rest| rest.split_once(':'))
            .ok_or_else(|| CryptoError::MalformedBlob("sealed value is not v<n>:<blob>".into()))?;
        let version = version
            .parse::<u32>()
            .ok()
            .filter(|v| *v >= 1)
            .ok_or_else(|| CryptoError::MalformedBlob("invalid sealed value version".into()))?;
        Ok(Self {
            version,
            blob: EncryptedBlob::parse(blob)?,
        })
    }
}

/// Counts from re-encrypting sealed values during a rotation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResealReport {
    /// Values now encrypted under the target version.
    pub resealed: usize,
    /// Values already at the target version.
    pub current: usize,
    /// Values that could not be opened and were left untouched.
    pub unreadable: usize,
}

/// Symmetric encryption keyed by key version.
pub struct CipherService {
    keys: Arc<KeyRing>,
    store: Arc<dyn SecureStore>,
}

impl CipherService {
    /// Service over a shared key ring and store.
    #[must_use]
    pub fn new(keys: Arc<KeyRing>, store: Arc<dyn SecureStore>) -> Self {
        Self { keys, store }
    }

    /// Encrypt under the general encryption key of `version`.
    ///
    /// Creates the key if this version has none yet.
    ///
    /// # Errors
    ///
    /// Storage failures or a cipher failure.
    pub async fn encrypt(&self, plaintext: &str, version: u32) -> Result<String, KeystoreError> {
        self.encrypt_with(KeyRole::Encryption, plaintext, version).await
    }

    /// Decrypt a blob produced by [`Self::encrypt`] with the same version.
    ///
    /// # Errors
    ///
    /// `CryptoError::MalformedBlob` unless the blob has exactly two
    /// dot-delimited parts, `CryptoError::DecryptionFailed` on a wrong key or
    /// corrupted data.
    pub async fn decrypt(&self, blob: &str, version: u32) -> Result<SecretBuffer, KeystoreError> {
        self.decrypt_with(KeyRole::Encryption, blob, version).await
    }

    /// [`Self::encrypt`] under an explicit key role.
    ///
    /// # Errors
    ///
    /// See [`Self::encrypt`].
    pub async fn encrypt_with(&self, role: KeyRole, plaintext: &str, version: u32) -> Result<String, KeystoreError> {
        let key = self.keys.material(role, version).await?;
        Ok(encrypt_str(plaintext, key.expose(), &[])?)
    }

    /// [`Self::decrypt`] under an explicit key role.
    ///
    /// # Errors
    ///
    /// See [`Self::decrypt`].
    pub async fn decrypt_with(&self, role: KeyRole, blob: &str, version: u32) -> Result<SecretBuffer, KeystoreError> {
        let parsed = EncryptedBlob::parse(blob)?;
        let key = self.keys.material(role, version).await?;
        Ok(decrypt(&parsed, key.expose(), &[])?)
    }

    /// Encrypt `plaintext` under `version` and store it as `name`.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a bad name, storage or cipher failures.
    pub async fn seal(&self, class: SecretClass, name: &str, plaintext: &str, version: u32) -> Result<(), KeystoreError> {
        validate_identifier("sealed value name", name)?;
        let key = class.storage_key(name);
        let value = self.seal_value(class, &key, plaintext.as_bytes(), version).await?;
        self.store.write(&key.to_string(), &value.to_string()).await?;
        Ok(())
    }

    /// Decrypt the value stored as `name`, under the version it was sealed with.
    ///
    /// Returns `Ok(None)` when nothing is stored under `name`.
    ///
    /// # Errors
    ///
    /// `MalformedBlob` for an unparseable stored value, `DecryptionFailed`
    /// when the value was tampered with, moved, or its key is gone.
    pub async fn open(&self, class: SecretClass, name: &str) -> Result<Option<SecretBuffer>, KeystoreError> {
        validate_identifier("sealed value name", name)?;
        let key = class.storage_key(name);
        let Some(raw) = self.store.read(&key.to_string()).await? else {
            return Ok(None);
        };
        let value: SealedValue = raw.parse()?;
        self.open_value(class, &key, &value).await.map(Some)
    }

    /// Delete the value stored as `name`.
    ///
    /// # Errors
    ///
    /// Storage failures or a bad name.
    pub async fn remove(&self, class: SecretClass, name: &str) -> Result<(), KeystoreError> {
        validate_identifier("sealed value name", name)?;
        self.store.delete(&class.storage_key(name).to_string()).await?;
        Ok(())
    }

    /// Names of every sealed value of `class`.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn sealed_names(&self, class: SecretClass) -> Result<Vec<String>, KeystoreError> {
        Ok(self
            .store
            .read_all()
            .await?
            .into_iter()
            .filter_map(|(raw, _)| {
                let key = StorageKey::parse(&raw)?;
                let (found, name) = SecretClass::from_storage_key(&key)?;
                (found == class).then(|| name.to_owned())
            })
            .collect())
    }

    /// Re-encrypt every sealed value under `target` key material.
    ///
    /// Values that no longer open are logged and left as they are.
    ///
    /// # Errors
    ///
    /// Storage or cipher failures while writing a re-encrypted value.
    pub async fn reseal_all(&self, target: u32) -> Result<ResealReport, KeystoreError> {
        let mut report = ResealReport::default();
        for (raw_key, raw_value) in self.store.read_all().await? {
            let Some(key) = StorageKey::parse(&raw_key) else {
                continue;
            };
            let Some((class, _)) = SecretClass::from_storage_key(&key) else {
                continue;
            };

            let opened = match raw_value.parse::<SealedValue>() {
                Ok(value) if value.version == target => {
                    report.current = report.current.saturating_add(1);
                    continue;
                }
                Ok(value) => self.open_value(class, &key, &value).await,
                Err(err) => Err(err.into()),
            };
            let plaintext = match opened {
                Ok(plaintext) => plaintext,
                Err(err) => {
                    tracing::warn!(key = %key, %err, "sealed value left at its old version");
                    report.unreadable = report.unreadable.saturating_add(1);
                    continue;
                }
            };

            let resealed = self.seal_value(class, &key, plaintext.expose(), target).await?;
            self.store.write(&raw_key, &resealed.to_string()).await?;
            report.resealed = report.resealed.saturating_add(1);
        }
        Ok(report)
    }

    async fn seal_value(
        &self,
        class: SecretClass,
        key: &StorageKey,
        plaintext: &[u8],
        version: u32,
    ) -> Result<SealedValue, KeystoreError> {
        let material = self.keys.material(class.role(), version).await?;
        let blob = encrypt(plaintext, material.expose(), key.to_string().as_bytes())?;
        Ok(SealedValue { version, blob })
    }

    async fn open_value(
        &self,
        class: SecretClass,
        key: &StorageKey,
        value: &SealedValue,
    ) -> Result<SecretBuffer, KeystoreError> {
        let material = self
            .keys
            .existing(class.role(), value.version)
            .await?
            .ok_or(CryptoError::DecryptionFailed)?;
        Ok(decrypt(&value.blob, material.expose(), key.to_string().as_bytes())?)
    }
}

impl fmt::Debug for CipherService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherService").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn service() -> (CipherService, Arc<MemoryStore>, Arc<KeyRing>) {
        let store = Arc::new(MemoryStore::new());
        let keys = Arc::new(KeyRing::new(store.clone()));
        (CipherService::new(keys.clone(), store.clone()), store, keys)
    }

    #[tokio::test]
    async fn encrypt_decrypt_roundtrip() {
        let (svc, _, _) = service();
        let blob = svc.encrypt("refresh-token-value", 1).await.unwrap();
        assert_eq!(blob.matches('.').count(), 1);
        let plain = svc.decrypt(&blob, 1).await.unwrap();
        assert_eq!(plain.expose_str().unwrap(), "refresh-token-value");
    }

    #[tokio::test]
    async fn fresh_iv_per_call() {
        let (svc, _, _) = service();
        let a = svc.encrypt("same", 1).await.unwrap();
        let b = svc.encrypt("same", 1).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn wrong_version_fails_to_decrypt() {
        let (svc, _, _) = service();
        let blob = svc.encrypt("secret", 1).await.unwrap();
        assert!(matches!(
            svc.decrypt(&blob, 2).await,
            Err(KeystoreError::Crypto(CryptoError::DecryptionFailed))
        ));
    }

    #[tokio::test]
    async fn malformed_blob_is_distinct() {
        let (svc, store, _) = service();
        for bad in ["no-separator", "a.b.c", ""] {
            assert!(matches!(
                svc.decrypt(bad, 1).await,
                Err(KeystoreError::Crypto(CryptoError::MalformedBlob(_)))
            ));
        }
        assert!(store.is_empty().await, "a malformed blob must not create keys");
    }

    #[tokio::test]
    async fn payment_role_uses_its_own_key() {
        let (svc, _, _) = service();
        let blob = svc
            .encrypt_with(KeyRole::PaymentEncryption, "4111", 1)
            .await
            .unwrap();
        assert!(svc.decrypt(&blob, 1).await.is_err());
        let plain = svc
            .decrypt_with(KeyRole::PaymentEncryption, &blob, 1)
            .await
            .unwrap();
        assert_eq!(plain.expose(), b"4111");
    }

    #[tokio::test]
    async fn seal_open_remove() {
        let (svc, store, _) = service();
        svc.seal(SecretClass::General, "api-token", "tok", 1).await.unwrap();
        let stored = store.read("sealed_api-token").await.unwrap().unwrap();
        assert!(stored.starts_with("v1:"));

        let opened = svc.open(SecretClass::General, "api-token").await.unwrap().unwrap();
        assert_eq!(opened.expose_str().unwrap(), "tok");

        svc.remove(SecretClass::General, "api-token").await.unwrap();
        assert!(svc.open(SecretClass::General, "api-token").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sealed_value_is_bound_to_its_name() {
        let (svc, store, _) = service();
        svc.seal(SecretClass::General, "a", "secret", 1).await.unwrap();
        let moved = store.read("sealed_a").await.unwrap().unwrap();
        store.write("sealed_b", &moved).await.unwrap();
        assert!(matches!(
            svc.open(SecretClass::General, "b").await,
            Err(KeystoreError::Crypto(CryptoError::DecryptionFailed))
        ));
    }

    #[tokio::test]
    async fn sealed_value_opens_after_version_moves_on() {
        let (svc, _, _) = service();
        svc.seal(SecretClass::Payment, "card", "4111", 1).await.unwrap();
        svc.seal(SecretClass::Payment, "iban", "DE00", 2).await.unwrap();
        let card = svc.open(SecretClass::Payment, "card").await.unwrap().unwrap();
        let iban = svc.open(SecretClass::Payment, "iban").await.unwrap().unwrap();
        assert_eq!(card.expose(), b"4111");
        assert_eq!(iban.expose(), b"DE00");
    }

    #[tokio::test]
    async fn reseal_all_moves_values_forward() {
        let (svc, store, _) = service();
        svc.seal(SecretClass::General, "a", "one", 1).await.unwrap();
        svc.seal(SecretClass::Payment, "b", "two", 1).await.unwrap();
        svc.seal(SecretClass::General, "c", "three", 2).await.unwrap();
        store.write("sealed_broken", "v1:garbage").await.unwrap();

        let report = svc.reseal_all(2).await.unwrap();
        assert_eq!(
            report,
            ResealReport {
                resealed: 2,
                current: 1,
                unreadable: 1
            }
        );
        assert!(store.read("sealed_a").await.unwrap().unwrap().starts_with("v2:"));
        let b = svc.open(SecretClass::Payment, "b").await.unwrap().unwrap();
        assert_eq!(b.expose(), b"two");
        assert_eq!(store.read("sealed_broken").await.unwrap().as_deref(), Some("v1:garbage"));
    }

    #[tokio::test]
    async fn sealed_names_by_class() {
        let (svc, _, _) = service();
        svc.seal(SecretClass::General, "x", "1", 1).await.unwrap();
        svc.seal(SecretClass::Payment, "y", "2", 1).await.unwrap();
        assert_eq!(svc.sealed_names(SecretClass::General).await.unwrap(), vec!["x"]);
        assert_eq!(svc.sealed_names(SecretClass::Payment).await.unwrap(), vec!["y"]);
    }

    #[test]
    fn sealed_value_text_form() {
        assert!("1:abc.def".parse::<SealedValue>().is_err());
        assert!("v0:abc.def".parse::<SealedValue>().is_err());
        assert!(matches!(
            "v1:only-one-part".parse::<SealedValue>(),
            Err(CryptoError::MalformedBlob(_))
        ));
    }

    #[tokio::test]
    async fn bad_name_is_rejected() {
        let (svc, _, _) = service();
        assert!(matches!(
            svc.seal(SecretClass::General, "has_underscore", "x", 1).await,
            Err(KeystoreError::InvalidInput(_))
        ));
    }
}
