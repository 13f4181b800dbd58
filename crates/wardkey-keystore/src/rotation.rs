//! Key version ownership, scheduled rotation, and failure recovery.
//!
//! The [`RotationManager`] is the only component that moves the current
//! key version. Everything else reads it through a [`VersionLease`],
//! which holds the shared side of a lock that rotation takes exclusively,
//! so no cipher or HMAC operation straddles a version swap.
//!
//! ```text
//! Normal ──rotate──► Normal (version M > N)
//!    │
//!    └─failure──► Recovering ──rollback verified──► Normal (version N)
//!                     │
//!                     └─rollback impossible──► emergency ──► EmergencyRecovered (version 1)
//!                                                  │
//!                                                  └─failure──► Err(Emergency), still Recovering
//! ```
//!
//! The store has no transactions. `key_rotation_recovery_mode` is written
//! before any recovery step and `key_rotation_in_progress` before any
//! rotation step, so a crash anywhere is detected by
//! [`RotationManager::resume_interrupted_rotation`] on the next start.
//! Superseded key material is never deleted here; sealed values and
//! integrity tags carry their key version and keep opening after a
//! rollback.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};

use crate::cipher_service::CipherService;
use crate::clock::{from_millis_str, to_millis_string, Clock};
use crate::config::KeystoreConfig;
use crate::credentials::retag_credentials;
use crate::error::{EmergencyRecoveryError, KeystoreError, RotationError, StorageError};
use crate::events::{SecurityEventKind, SecurityLog};
use crate::integrity_service::IntegrityService;
use crate::keyring::KeyRing;
use crate::storage_key::{KeyRole, StorageKey};
use crate::store::SecureStore;

/// Persisted rotation state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationState {
    /// No rotation failure pending.
    Normal,
    /// A rotation failed and rollback or emergency recovery has not finished.
    Recovering,
    /// The last recovery reset the key set to version 1.
    EmergencyRecovered,
}

impl RotationState {
    /// Stored form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Recovering => "recovering",
            Self::EmergencyRecovered => "emergency_recovered",
        }
    }

    /// Parse the stored form. The boolean flag of older stores maps to
    /// `Recovering`/`Normal`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "normal" | "false" => Some(Self::Normal),
            "recovering" | "true" => Some(Self::Recovering),
            "emergency_recovered" => Some(Self::EmergencyRecovered),
            _ => None,
        }
    }
}

/// Result of a rotation check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationOutcome {
    /// The interval has not elapsed.
    NotDue,
    /// Rotation was due but a previous failure is still being recovered.
    Skipped,
    /// Keys moved to a new version.
    Rotated {
        /// Version before rotation.
        from: u32,
        /// New current version.
        to: u32,
    },
    /// Rotation failed; the pointer was restored and verified.
    RolledBack {
        /// The restored current version.
        version: u32,
    },
    /// Rollback was impossible; the key set was reset to version 1.
    EmergencyRecovered {
        /// Stamp of the `key_backup_{stamp}_*` snapshot taken first.
        backup_stamp: i64,
    },
}

impl fmt::Display for RotationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotDue => f.write_str("not due"),
            Self::Skipped => f.write_str("skipped while recovering"),
            Self::Rotated { from, to } => write!(f, "rotated from version {from} to version {to}"),
            Self::RolledBack { version } => write!(f, "rolled back to version {version}"),
            Self::EmergencyRecovered { .. } => f.write_str("emergency reset to version 1"),
        }
    }
}

/// The current key version, pinned for as long as the lease lives.
pub struct VersionLease<'a> {
    version: u32,
    _shared: RwLockReadGuard<'a, ()>,
}

impl VersionLease<'_> {
    /// The pinned version.
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }
}

impl fmt::Debug for VersionLease<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionLease")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Owns the current key version and the rotation state machine.
pub struct RotationManager {
    store: Arc<dyn SecureStore>,
    keys: Arc<KeyRing>,
    cipher: Arc<CipherService>,
    integrity: Arc<IntegrityService>,
    clock: Arc<dyn Clock>,
    log: SecurityLog,
    interval: TimeDelta,
    gate: RwLock<()>,
    flight: Mutex<()>,
}

impl RotationManager {
    /// Wire the manager to its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn SecureStore>,
        keys: Arc<KeyRing>,
        cipher: Arc<CipherService>,
        integrity: Arc<IntegrityService>,
        clock: Arc<dyn Clock>,
        log: SecurityLog,
        config: &KeystoreConfig,
    ) -> Self {
        Self {
            store,
            keys,
            cipher,
            integrity,
            clock,
            log,
            interval: config.rotation_interval(),
            gate: RwLock::new(()),
            flight: Mutex::new(()),
        }
    }

    // ── Reading ────────────────────────────────────────────────────

    /// Pin the current version for the duration of one operation.
    ///
    /// Initializes the version pointer, the rotation timestamp and the
    /// version 1 HMAC master key on first use. Do not hold two leases in
    /// one task: a waiting rotation blocks the second.
    ///
    /// # Errors
    ///
    /// Storage failures, or an unparseable version pointer.
    pub async fn lease(&self) -> Result<VersionLease<'_>, KeystoreError> {
        let shared = self.gate.read().await;
        let version = match self.read_version().await? {
            Some(version) => version,
            None => self.initialize_unlocked().await?.0,
        };
        Ok(VersionLease {
            version,
            _shared: shared,
        })
    }

    /// Ensure the version pointer, rotation timestamp and HMAC key exist.
    /// Returns the current version.
    ///
    /// # Errors
    ///
    /// Storage failures, or an unparseable version pointer.
    pub async fn initialize(&self) -> Result<u32, KeystoreError> {
        let _exclusive = self.gate.write().await;
        Ok(self.initialize_unlocked().await?.0)
    }

    /// The stored current version, without locking.
    ///
    /// # Errors
    ///
    /// Storage failures, or an unparseable version pointer.
    pub async fn current_version(&self) -> Result<Option<u32>, KeystoreError> {
        self.read_version().await
    }

    /// The persisted rotation state. Unknown stored values read as
    /// `Recovering` so that no rotation starts on top of them.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn state(&self) -> Result<RotationState, KeystoreError> {
        let Some(raw) = self.store.read(&StorageKey::RotationRecoveryMode.to_string()).await? else {
            return Ok(RotationState::Normal);
        };
        Ok(RotationState::parse(&raw).unwrap_or_else(|| {
            tracing::warn!("unknown rotation state, treating as recovering");
            RotationState::Recovering
        }))
    }

    /// When keys were last rotated (or first initialized).
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn last_rotation(&self) -> Result<Option<DateTime<Utc>>, KeystoreError> {
        Ok(self
            .store
            .read(&StorageKey::LastKeyRotation.to_string())
            .await?
            .as_deref()
            .and_then(from_millis_str))
    }

    /// Stamps of every emergency key snapshot in the store, oldest first.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn list_key_backups(&self) -> Result<Vec<i64>, KeystoreError> {
        let stamps: BTreeSet<i64> = self
            .store
            .read_all()
            .await?
            .into_iter()
            .filter_map(|(raw, _)| match StorageKey::parse(&raw)? {
                StorageKey::KeyBackup { stamp, .. } => Some(stamp),
                _ => None,
            })
            .collect();
        Ok(stamps.into_iter().collect())
    }

    // ── Rotation ───────────────────────────────────────────────────

    /// Rotate all key roles if the interval has elapsed.
    ///
    /// Single-flight: a concurrent caller waits, then sees `NotDue`.
    ///
    /// # Errors
    ///
    /// Storage failures before rotation starts, and
    /// [`KeystoreError::Emergency`] when emergency recovery itself fails.
    /// Every other rotation failure is handled and reported through the
    /// returned outcome.
    pub async fn check_and_rotate_if_due(&self) -> Result<RotationOutcome, KeystoreError> {
        let _single = self.flight.lock().await;
        let _exclusive = self.gate.write().await;

        let (version, last) = self.initialize_unlocked().await?;
        let now = self.clock.now();
        if now.signed_duration_since(last) <= self.interval {
            return Ok(RotationOutcome::NotDue);
        }

        if self.state().await? == RotationState::Recovering {
            self.log.system_event(
                SecurityEventKind::KeyRotationSkipped,
                "rotation due but a previous rotation failure is still being recovered",
            );
            return Ok(RotationOutcome::Skipped);
        }

        tracing::info!(from = version, "key rotation due");
        match self.rotate(version).await {
            Ok(to) => Ok(RotationOutcome::Rotated { from: version, to }),
            Err(failure) => self.recover(version, failure).await,
        }
    }

    /// Finish recovery for a rotation that was interrupted by a crash or
    /// left `Recovering` by a failed recovery. Returns `None` when there
    /// is nothing to resume.
    ///
    /// # Errors
    ///
    /// Storage failures reading the state, and [`KeystoreError::Emergency`]
    /// when emergency recovery fails.
    pub async fn resume_interrupted_rotation(&self) -> Result<Option<RotationOutcome>, KeystoreError> {
        let _single = self.flight.lock().await;
        let _exclusive = self.gate.write().await;

        let state = self.state().await?;
        let marker = self
            .store
            .read(&StorageKey::RotationInProgress.to_string())
            .await?;
        if state != RotationState::Recovering && marker.is_none() {
            return Ok(None);
        }

        let from = match marker.as_deref().and_then(|m| m.trim().parse::<u32>().ok()) {
            Some(from) => Some(from),
            None => self.read_version().await.ok().flatten(),
        };
        tracing::warn!(?state, ?from, "resuming interrupted key rotation");
        self.mark_recovering().await;

        let outcome = match from {
            Some(from) => match self.rollback(from, "rotation was interrupted").await {
                Ok(()) => RotationOutcome::RolledBack { version: from },
                Err(critical) => self.emergency_recover(&critical).await?,
            },
            None => {
                let critical = RotationError::Critical("version pointer unreadable".into());
                self.emergency_recover(&critical).await?
            }
        };
        self.log.system_event(
            SecurityEventKind::KeyRotationRecovered,
            &format!("interrupted rotation resolved: {outcome}"),
        );
        Ok(Some(outcome))
    }

    async fn rotate(&self, from: u32) -> Result<u32, RotationError> {
        let recoverable = |err: KeystoreError| RotationError::Recoverable(err.to_string());

        self.put(StorageKey::RotationInProgress, &from.to_string())
            .await
            .map_err(recoverable)?;
        let to = self
            .keys
            .next_free_version(from)
            .await
            .map_err(|err| RotationError::Critical(err.to_string()))?;
        tracing::debug!(from, to, "allocating key version");

        for role in KeyRole::ALL {
            self.keys.generate(role, to).await.map_err(recoverable)?;
        }
        let sealed = self.cipher.reseal_all(to).await.map_err(recoverable)?;
        let tags = retag_credentials(self.store.as_ref(), &self.integrity, &self.log, to)
            .await
            .map_err(recoverable)?;
        tracing::debug!(?sealed, ?tags, "dependents moved to new version");

        self.put(StorageKey::CurrentKeyVersion, &to.to_string())
            .await
            .map_err(recoverable)?;
        self.put(StorageKey::LastKeyRotation, &to_millis_string(self.clock.now()))
            .await
            .map_err(recoverable)?;
        self.settle(RotationState::Normal).await.map_err(recoverable)?;

        self.log.system_event(
            SecurityEventKind::KeyRotation,
            &format!("rotated keys from version {from} to version {to}"),
        );
        tracing::info!(from, to, "key rotation complete");
        Ok(to)
    }

    // ── Recovery ───────────────────────────────────────────────────

    async fn recover(&self, from: u32, failure: RotationError) -> Result<RotationOutcome, KeystoreError> {
        tracing::warn!(from, %failure, "key rotation failed");
        self.mark_recovering().await;

        let critical = match failure {
            RotationError::Recoverable(reason) => match self.rollback(from, &reason).await {
                Ok(()) => return Ok(RotationOutcome::RolledBack { version: from }),
                Err(critical) => critical,
            },
            critical @ RotationError::Critical(_) => critical,
        };
        self.emergency_recover(&critical).await
    }

    /// Durable recovery flag, written before any recovery step. A failed
    /// write is logged; recovery proceeds regardless.
    async fn mark_recovering(&self) {
        if let Err(err) = self
            .put(StorageKey::RotationRecoveryMode, RotationState::Recovering.as_str())
            .await
        {
            tracing::error!(%err, "could not persist rotation recovery flag");
        }
    }

    async fn rollback(&self, to: u32, reason: &str) -> Result<(), RotationError> {
        if to <= 1 {
            return Err(RotationError::Critical(format!(
                "rotation from version {to} failed ({reason}) and there is no earlier version"
            )));
        }
        let pointer = self
            .read_version()
            .await
            .map_err(|err| RotationError::Critical(format!("version pointer unreadable: {err}")))?
            .ok_or_else(|| RotationError::Critical("version pointer missing".into()))?;
        tracing::debug!(pointer, to, "rolling back version pointer");

        self.put(StorageKey::CurrentKeyVersion, &to.to_string())
            .await
            .map_err(|err| RotationError::Critical(format!("rollback write failed: {err}")))?;
        let confirmed = self.read_version().await.ok().flatten();
        if confirmed != Some(to) {
            return Err(RotationError::Critical(format!(
                "rollback to version {to} could not be verified"
            )));
        }

        self.settle(RotationState::Normal)
            .await
            .map_err(|err| RotationError::Critical(format!("could not clear recovery flag: {err}")))?;

        self.log.system_event(
            SecurityEventKind::KeyRotationFailed,
            &format!("rotation from version {to} failed and was rolled back: {reason}"),
        );
        Ok(())
    }

    async fn emergency_recover(&self, cause: &RotationError) -> Result<RotationOutcome, KeystoreError> {
        self.log.system_event(
            SecurityEventKind::KeyRotationCritical,
            &format!("rollback impossible, starting emergency key recovery: {cause}"),
        );

        let stamp = self.clock.now().timestamp_millis();
        match self.emergency_steps(stamp).await {
            Ok(()) => {
                self.log.system_event(
                    SecurityEventKind::KeyRotationEmergency,
                    "key set reset to version 1; previous key material snapshotted for forensics",
                );
                tracing::warn!(backup_stamp = stamp, "emergency key recovery complete");
                Ok(RotationOutcome::EmergencyRecovered { backup_stamp: stamp })
            }
            Err(err) => {
                self.log
                    .system_event(SecurityEventKind::KeyRotationCritical, &err.to_string());
                tracing::error!(%err, "emergency key recovery failed, operator action required");
                Err(err.into())
            }
        }
    }

    async fn emergency_steps(&self, stamp: i64) -> Result<(), EmergencyRecoveryError> {
        let entries = self
            .keys
            .material_entries()
            .await
            .map_err(|err| step_failed("snapshot", err))?;
        for (original, value) in &entries {
            let backup = StorageKey::KeyBackup {
                stamp,
                original: Box::new(original.clone()),
            };
            self.store
                .write(&backup.to_string(), value)
                .await
                .map_err(|err| step_failed("snapshot", err))?;
        }
        tracing::debug!(count = entries.len(), "key material snapshotted");

        for role in KeyRole::ALL {
            self.keys
                .generate(role, 1)
                .await
                .map_err(|err| step_failed("regenerate", err))?;
        }

        self.reset_pointer()
            .await
            .map_err(|err| step_failed("reset_pointer", err))
    }

    async fn reset_pointer(&self) -> Result<(), KeystoreError> {
        self.put(StorageKey::CurrentKeyVersion, "1").await?;
        self.put(StorageKey::LastKeyRotation, &to_millis_string(self.clock.now()))
            .await?;
        self.settle(RotationState::EmergencyRecovered).await
    }

    /// Drop the in-progress marker and persist the resting state.
    async fn settle(&self, state: RotationState) -> Result<(), KeystoreError> {
        self.remove(StorageKey::RotationInProgress).await?;
        self.put(StorageKey::RotationRecoveryMode, state.as_str()).await
    }

    // ── Storage helpers ────────────────────────────────────────────

    async fn initialize_unlocked(&self) -> Result<(u32, DateTime<Utc>), KeystoreError> {
        let version = match self.read_version().await? {
            Some(version) => version,
            None => {
                self.put(StorageKey::CurrentKeyVersion, "1").await?;
                tracing::info!("initialized key version 1");
                1
            }
        };
        let last = match self.last_rotation().await? {
            Some(last) => last,
            None => {
                let now = self.clock.now();
                self.put(StorageKey::LastKeyRotation, &to_millis_string(now))
                    .await?;
                now
            }
        };
        self.keys.material(KeyRole::Hmac, version).await?;
        Ok((version, last))
    }

    async fn read_version(&self) -> Result<Option<u32>, KeystoreError> {
        let key = StorageKey::CurrentKeyVersion.to_string();
        let Some(raw) = self.store.read(&key).await? else {
            return Ok(None);
        };
        raw.trim()
            .parse::<u32>()
            .ok()
            .filter(|v| *v >= 1)
            .map(Some)
            .ok_or_else(|| {
                StorageError::Corrupt {
                    key,
                    reason: "version pointer is not a positive integer".into(),
                }
                .into()
            })
    }

    async fn put(&self, key: StorageKey, value: &str) -> Result<(), KeystoreError> {
        Ok(self.store.write(&key.to_string(), value).await?)
    }

    async fn remove(&self, key: StorageKey) -> Result<(), KeystoreError> {
        Ok(self.store.delete(&key.to_string()).await?)
    }
}

impl fmt::Debug for RotationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationManager")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

fn step_failed(step: &'static str, err: impl fmt::Display) -> EmergencyRecoveryError {
    EmergencyRecoveryError {
        step,
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::MemorySink;
    use crate::store::MemoryStore;

    fn manager() -> (RotationManager, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_704_067_200, 0).unwrap(),
        ));
        let log = SecurityLog::new(Arc::new(MemorySink::new()), clock.clone());
        let keys = Arc::new(KeyRing::new(store.clone()));
        let cipher = Arc::new(CipherService::new(keys.clone(), store.clone()));
        let integrity = Arc::new(IntegrityService::new(keys.clone()));
        let manager = RotationManager::new(
            store.clone(),
            keys,
            cipher,
            integrity,
            clock.clone(),
            log,
            &KeystoreConfig::default(),
        );
        (manager, store, clock)
    }

    #[test]
    fn state_roundtrips_through_storage_form() {
        for state in [
            RotationState::Normal,
            RotationState::Recovering,
            RotationState::EmergencyRecovered,
        ] {
            assert_eq!(RotationState::parse(state.as_str()), Some(state));
        }
        assert_eq!(RotationState::parse("true"), Some(RotationState::Recovering));
        assert_eq!(RotationState::parse(" false\n"), Some(RotationState::Normal));
        assert_eq!(RotationState::parse("maybe"), None);
    }

    #[test]
    fn outcome_display() {
        assert_eq!(
            RotationOutcome::Rotated { from: 3, to: 5 }.to_string(),
            "rotated from version 3 to version 5"
        );
        assert_eq!(
            RotationOutcome::RolledBack { version: 2 }.to_string(),
            "rolled back to version 2"
        );
        assert_eq!(
            RotationOutcome::EmergencyRecovered { backup_stamp: 1 }.to_string(),
            "emergency reset to version 1"
        );
    }

    #[tokio::test]
    async fn lease_initializes_on_first_use() {
        let (manager, store, _) = manager();
        assert_eq!(manager.current_version().await.unwrap(), None);
        assert_eq!(manager.lease().await.unwrap().version(), 1);
        assert_eq!(
            store.read("current_key_version").await.unwrap().as_deref(),
            Some("1")
        );
        assert!(store.read("hmac_master_key_v1").await.unwrap().is_some());
        assert!(manager.last_rotation().await.unwrap().is_some());
        assert_eq!(manager.state().await.unwrap(), RotationState::Normal);
    }

    #[tokio::test]
    async fn rollback_from_version_one_is_critical() {
        let (manager, _, _) = manager();
        manager.initialize().await.unwrap();
        assert!(matches!(
            manager.rollback(1, "test").await,
            Err(RotationError::Critical(_))
        ));
    }

    #[tokio::test]
    async fn rollback_requires_a_pointer() {
        let (manager, store, _) = manager();
        manager.initialize().await.unwrap();
        store.delete("current_key_version").await.unwrap();
        assert!(matches!(
            manager.rollback(4, "test").await,
            Err(RotationError::Critical(_))
        ));
    }

    #[tokio::test]
    async fn backups_are_listed_by_stamp() {
        let (manager, store, _) = manager();
        store.write("key_backup_20_encryption_key_v1", "x").await.unwrap();
        store.write("key_backup_10_hmac_master_key_v1", "x").await.unwrap();
        store.write("key_backup_20_hmac_master_key_v1", "x").await.unwrap();
        assert_eq!(manager.list_key_backups().await.unwrap(), vec![10, 20]);
    }

    #[tokio::test]
    async fn rotation_is_due_only_after_interval() {
        let (manager, _, clock) = manager();
        manager.initialize().await.unwrap();
        clock.advance(TimeDelta::days(29));
        assert_eq!(
            manager.check_and_rotate_if_due().await.unwrap(),
            RotationOutcome::NotDue
        );
        clock.advance(TimeDelta::days(2));
        assert_eq!(
            manager.check_and_rotate_if_due().await.unwrap(),
            RotationOutcome::Rotated { from: 1, to: 2 }
        );
        assert_eq!(manager.current_version().await.unwrap(), Some(2));
    }
}
