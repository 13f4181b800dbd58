//! Per-role, per-version key material held in the secure store.
//!
//! Each entry is 32 random bytes, base64-encoded, stored under the
//! role's versioned key (`encryption_key_v3`). Material is created lazily
//! on first use; creation is serialized so two concurrent first uses of
//! the same version cannot each write a different key.

use std::collections::BTreeSet;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::sync::Mutex;
use wardkey_crypto_core::cipher::KEY_LEN;
use wardkey_crypto_core::SecretBuffer;
use zeroize::Zeroizing;

use crate::error::{KeystoreError, StorageError};
use crate::storage_key::{KeyRole, StorageKey, LEGACY_HMAC_MASTER_KEY};
use crate::store::SecureStore;

/// Access to versioned key material.
pub struct KeyRing {
    store: Arc<dyn SecureStore>,
    create: Mutex<()>,
}

impl KeyRing {
    /// Key ring over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn SecureStore>) -> Self {
        Self {
            store,
            create: Mutex::new(()),
        }
    }

    /// Material for `(role, version)`, generated and persisted if absent.
    ///
    /// # Errors
    ///
    /// Storage failures, a corrupt stored key, or version 0.
    pub async fn material(&self, role: KeyRole, version: u32) -> Result<SecretBuffer, KeystoreError> {
        if let Some(existing) = self.existing(role, version).await? {
            return Ok(existing);
        }
        let _creating = self.create.lock().await;
        if let Some(existing) = self.existing(role, version).await? {
            return Ok(existing);
        }
        tracing::debug!(role = role.as_str(), version, "creating key material");
        self.generate(role, version).await
    }

    /// Material for `(role, version)` if it has been created.
    ///
    /// # Errors
    ///
    /// Storage failures, a corrupt stored key, or version 0.
    pub async fn existing(&self, role: KeyRole, version: u32) -> Result<Option<SecretBuffer>, KeystoreError> {
        check_version(version)?;
        let key = role.key(version);
        let mut stored = self.store.read(&key.to_string()).await?;
        if stored.is_none() && key == StorageKey::HmacMasterKey(1) {
            stored = self.store.read(LEGACY_HMAC_MASTER_KEY).await?;
        }
        let Some(encoded) = stored else {
            return Ok(None);
        };
        decode_material(&key, &Zeroizing::new(encoded)).map(Some)
    }

    /// Write fresh material for `(role, version)`, replacing any existing key.
    ///
    /// # Errors
    ///
    /// Storage or RNG failures, or version 0.
    pub async fn generate(&self, role: KeyRole, version: u32) -> Result<SecretBuffer, KeystoreError> {
        check_version(version)?;
        let material = SecretBuffer::random(KEY_LEN)?;
        let encoded = Zeroizing::new(STANDARD.encode(material.expose()));
        self.store
            .write(&role.key(version).to_string(), &encoded)
            .await?;
        Ok(material)
    }

    /// Every version that has material for at least one role.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn versions(&self) -> Result<BTreeSet<u32>, KeystoreError> {
        Ok(self
            .material_entries()
            .await?
            .into_iter()
            .filter_map(|(key, _)| key.key_material().map(|(_, v)| v))
            .collect())
    }

    /// Lowest version above `after` with no material for any role.
    ///
    /// # Errors
    ///
    /// Storage failures, or the version space is exhausted.
    pub async fn next_free_version(&self, after: u32) -> Result<u32, KeystoreError> {
        let used = self.versions().await?;
        let exhausted = || KeystoreError::InvalidInput("key version space exhausted".into());
        let mut candidate = after.checked_add(1).ok_or_else(exhausted)?;
        while used.contains(&candidate) {
            candidate = candidate.checked_add(1).ok_or_else(exhausted)?;
        }
        Ok(candidate)
    }

    /// Raw stored entries of every key material version.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn material_entries(&self) -> Result<Vec<(StorageKey, Zeroizing<String>)>, KeystoreError> {
        Ok(self
            .store
            .read_all()
            .await?
            .into_iter()
            .filter_map(|(raw, value)| {
                StorageKey::parse(&raw)
                    .filter(StorageKey::is_key_material)
                    .map(|key| (key, Zeroizing::new(value)))
            })
            .collect())
    }
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing").finish_non_exhaustive()
    }
}

fn check_version(version: u32) -> Result<(), KeystoreError> {
    if version == 0 {
        return Err(KeystoreError::InvalidInput("key versions start at 1".into()));
    }
    Ok(())
}

fn decode_material(key: &StorageKey, encoded: &str) -> Result<SecretBuffer, KeystoreError> {
    let corrupt = |reason: &str| StorageError::Corrupt {
        key: key.to_string(),
        reason: reason.to_owned(),
    };
    let raw = Zeroizing::new(
        STANDARD
            .decode(encoded.trim())
            .map_err(|_| corrupt("key material is not base64"))?,
    );
    if raw.len() != KEY_LEN {
        return Err(corrupt("key material has the wrong length").into());
    }
    Ok(SecretBuffer::new(&raw))
}
