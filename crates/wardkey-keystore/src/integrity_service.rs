//! HMAC integrity tags keyed by the versioned HMAC master key.

use std::sync::Arc;

use wardkey_crypto_core::IntegrityTag;

use crate::error::KeystoreError;
use crate::keyring::KeyRing;
use crate::storage_key::KeyRole;

/// Computes and checks integrity tags over stored secrets.
#[derive(Debug)]
pub struct IntegrityService {
    keys: Arc<KeyRing>,
}

impl IntegrityService {
    /// Service over a shared key ring.
    #[must_use]
    pub const fn new(keys: Arc<KeyRing>) -> Self {
        Self { keys }
    }

    /// Tag `data` in `context` under the HMAC master key of `version`,
    /// creating that key on first use.
    ///
    /// # Errors
    ///
    /// Storage failures or corrupt key material.
    pub async fn hmac(&self, data: &[u8], context: &[u8], version: u32) -> Result<IntegrityTag, KeystoreError> {
        let key = self.keys.material(KeyRole::Hmac, version).await?;
        Ok(IntegrityTag::compute(version, key.expose(), data, context)?)
    }

    /// Check `expected` against `data` in `context`, in constant time,
    /// under the key version recorded in the tag.
    ///
    /// A tag whose key version no longer exists does not verify. A
    /// `false` result is a tamper signal, not a wrong credential.
    ///
    /// # Errors
    ///
    /// Storage failures or corrupt key material.
    pub async fn verify(&self, expected: &IntegrityTag, data: &[u8], context: &[u8]) -> Result<bool, KeystoreError> {
        let Some(key) = self.keys.existing(KeyRole::Hmac, expected.version).await? else {
            tracing::debug!(version = expected.version, "no HMAC key for tag version");
            return Ok(false);
        };
        Ok(expected.verify(key.expose(), data, context)?)
    }

    /// [`Self::verify`] for a tag in its stored `v<n>:<base64>` form.
    /// Unparseable text does not verify.
    ///
    /// # Errors
    ///
    /// Storage failures or corrupt key material.
    pub async fn verify_stored(&self, stored: &str, data: &[u8], context: &[u8]) -> Result<bool, KeystoreError> {
        match stored.parse::<IntegrityTag>() {
            Ok(tag) => self.verify(&tag, data, context).await,
            Err(_) => Ok(false),
        }
    }

    /// Re-tag data whose current tag is `stored`, moving it to `target`.
    ///
    /// Returns `Ok(None)` if `stored` does not verify; the caller decides
    /// how to report that.
    ///
    /// # Errors
    ///
    /// Storage failures or corrupt key material.
    pub async fn retag(
        &self,
        stored: &str,
        data: &[u8],
        context: &[u8],
        target: u32,
    ) -> Result<Option<IntegrityTag>, KeystoreError> {
        if !self.verify_stored(stored, data, context).await? {
            return Ok(None);
        }
        self.hmac(data, context, target).await.map(Some)
    }
}
