//! One-stop wiring of the credential core around a single secure store.

use std::sync::Arc;

use wardkey_crypto_core::SecretBuffer;

use crate::cipher_service::{CipherService, SecretClass};
use crate::clock::{Clock, SystemClock};
use crate::config::KeystoreConfig;
use crate::credentials::CredentialStore;
use crate::error::KeystoreError;
use crate::events::{SecurityEventSink, SecurityLog, TracingSink};
use crate::integrity_service::IntegrityService;
use crate::keyring::KeyRing;
use crate::rotation::{RotationManager, RotationOutcome};
use crate::store::SecureStore;

/// The credential and key-management core.
///
/// Construct once and share (`Arc<SecurityCore>`); every service inside
/// holds the same store handle, clock and event sink.
#[derive(Debug)]
pub struct SecurityCore {
    config: KeystoreConfig,
    cipher: Arc<CipherService>,
    integrity: Arc<IntegrityService>,
    rotation: Arc<RotationManager>,
    credentials: CredentialStore,
}

impl SecurityCore {
    /// Wire all services.
    ///
    /// # Errors
    ///
    /// [`KeystoreError::Config`] if `config` does not validate.
    pub fn new(
        store: Arc<dyn SecureStore>,
        config: KeystoreConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn SecurityEventSink>,
    ) -> Result<Self, KeystoreError> {
        config.validate()?;
        let log = SecurityLog::new(sink, clock.clone());
        let keys = Arc::new(KeyRing::new(store.clone()));
        let cipher = Arc::new(CipherService::new(keys.clone(), store.clone()));
        let integrity = Arc::new(IntegrityService::new(keys.clone()));
        let rotation = Arc::new(RotationManager::new(
            store.clone(),
            keys,
            cipher.clone(),
            integrity.clone(),
            clock.clone(),
            log.clone(),
            &config,
        ));
        let credentials = CredentialStore::new(
            store,
            integrity.clone(),
            rotation.clone(),
            clock,
            log,
            &config,
        );
        Ok(Self {
            config,
            cipher,
            integrity,
            rotation,
            credentials,
        })
    }

    /// Default configuration, the system clock, and `tracing` for events.
    ///
    /// # Errors
    ///
    /// Never in practice; the default configuration validates.
    pub fn with_defaults(store: Arc<dyn SecureStore>) -> Result<Self, KeystoreError> {
        Self::new(
            store,
            KeystoreConfig::default(),
            Arc::new(SystemClock),
            Arc::new(TracingSink),
        )
    }

    /// Startup sequence: recovery of an interrupted rotation, first-run
    /// initialization, then the scheduled rotation check.
    ///
    /// Recovery runs first because an interrupted rotation may have left
    /// a version pointer that initialization cannot read.
    ///
    /// Safe to call from several places concurrently.
    ///
    /// # Errors
    ///
    /// Storage failures, or a fatal [`KeystoreError::Emergency`].
    pub async fn ensure_initialized(&self) -> Result<RotationOutcome, KeystoreError> {
        if let Some(outcome) = self.rotation.resume_interrupted_rotation().await? {
            return Ok(outcome);
        }
        let version = self.rotation.initialize().await?;
        tracing::debug!(version, "security core initialized");
        self.rotation.check_and_rotate_if_due().await
    }

    /// Seal `plaintext` as `name` under the current key version.
    ///
    /// # Errors
    ///
    /// See [`CipherService::seal`].
    pub async fn seal(&self, class: SecretClass, name: &str, plaintext: &str) -> Result<(), KeystoreError> {
        let lease = self.rotation.lease().await?;
        self.cipher.seal(class, name, plaintext, lease.version()).await
    }

    /// Open the sealed value `name`.
    ///
    /// # Errors
    ///
    /// See [`CipherService::open`].
    pub async fn open(&self, class: SecretClass, name: &str) -> Result<Option<SecretBuffer>, KeystoreError> {
        let _lease = self.rotation.lease().await?;
        self.cipher.open(class, name).await
    }

    /// Encrypt under the current version. Returns the version with the
    /// blob; the caller needs both to decrypt.
    ///
    /// # Errors
    ///
    /// See [`CipherService::encrypt`].
    pub async fn encrypt_current(&self, plaintext: &str) -> Result<(u32, String), KeystoreError> {
        let lease = self.rotation.lease().await?;
        let blob = self.cipher.encrypt(plaintext, lease.version()).await?;
        Ok((lease.version(), blob))
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &KeystoreConfig {
        &self.config
    }

    /// Cipher service.
    #[must_use]
    pub fn cipher(&self) -> &CipherService {
        &self.cipher
    }

    /// Integrity service.
    #[must_use]
    pub fn integrity(&self) -> &IntegrityService {
        &self.integrity
    }

    /// Rotation manager.
    #[must_use]
    pub fn rotation(&self) -> &RotationManager {
        &self.rotation
    }

    /// Credential store.
    #[must_use]
    pub const fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }
}
