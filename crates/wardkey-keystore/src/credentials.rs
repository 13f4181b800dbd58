//! PINs, one-time verification codes, and related per-user flags.
//!
//! Every stored secret carries an integrity tag, and the tag is always
//! checked before the secret is trusted:
//!
//! - PIN: `pin_{user}` (base64 Argon2id hash), `pin_salt_{user}` (base64
//!   salt), `pin_hmac_{user}` over the hash text with the salt text as
//!   context, `pin_created_{user}` (Unix millis).
//! - Code: `verification_code_{user}`, `verification_code_expiry_{user}`
//!   (Unix millis), `verification_code_hmac_{user}` over
//!   `"{code}|{expiry}"` with the user id as context. Binding the expiry
//!   means it cannot be extended by editing storage.
//!
//! A failed tag is a tamper signal: it is reported as a security event
//! and the verification fails, whatever the candidate.
//!
//! Argon2id runs on Tokio's blocking pool, so PIN operations must be
//! called from within a Tokio runtime.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use wardkey_crypto_core::{
    constant_time_eq, generate_salt, hash_pin, verify_pin_hash, CryptoError, IntegrityTag, PinHashParams,
};
use zeroize::Zeroizing;

use crate::attempts::LoginAttempts;
use crate::clock::{from_millis_str, to_millis_string, Clock};
use crate::config::KeystoreConfig;
use crate::error::KeystoreError;
use crate::events::{SecurityEventKind, SecurityLog};
use crate::integrity_service::IntegrityService;
use crate::rotation::RotationManager;
use crate::storage_key::{validate_identifier, StorageKey};
use crate::store::SecureStore;

/// Verification codes are six digits in this range.
pub const CODE_RANGE: std::ops::RangeInclusive<u32> = 100_000..=999_999;

/// Accepted PIN length in digits.
pub const PIN_LEN: std::ops::RangeInclusive<usize> = 4..=12;

/// Salted PIN hashes, verification codes, biometric flags and the
/// failed-attempt limiter.
pub struct CredentialStore {
    store: Arc<dyn SecureStore>,
    integrity: Arc<IntegrityService>,
    rotation: Arc<RotationManager>,
    attempts: LoginAttempts,
    clock: Arc<dyn Clock>,
    log: SecurityLog,
    pin_hash: PinHashParams,
    pin_rotation_age: TimeDelta,
    code_ttl: TimeDelta,
}

impl CredentialStore {
    /// Wire the store to its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn SecureStore>,
        integrity: Arc<IntegrityService>,
        rotation: Arc<RotationManager>,
        clock: Arc<dyn Clock>,
        log: SecurityLog,
        config: &KeystoreConfig,
    ) -> Self {
        Self {
            attempts: LoginAttempts::new(config, clock.clone(), log.clone()),
            store,
            integrity,
            rotation,
            clock,
            log,
            pin_hash: config.pin_hash.clone(),
            pin_rotation_age: config.pin_rotation_age(),
            code_ttl: config.verification_code_ttl(),
        }
    }

    // ── PIN ────────────────────────────────────────────────────────

    /// Hash and store `pin` for `user`, replacing any previous PIN.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a bad user id or a PIN that is not 4-12 digits;
    /// storage and hashing failures.
    pub async fn store_pin(&self, user: &str, pin: &str) -> Result<(), KeystoreError> {
        validate_identifier("user id", user)?;
        if !PIN_LEN.contains(&pin.len()) || !pin.bytes().all(|b| b.is_ascii_digit()) {
            return Err(KeystoreError::InvalidInput("PIN must be 4-12 digits".into()));
        }

        let lease = self.rotation.lease().await?;
        let salt = generate_salt();
        let secret = Zeroizing::new(pin.as_bytes().to_vec());
        let params = self.pin_hash.clone();
        let hash = off_executor(move || hash_pin(&secret, &salt, &params)).await?;
        let hash_text = Zeroizing::new(STANDARD.encode(hash.expose()));
        let salt_text = STANDARD.encode(salt);
        let tag = self
            .integrity
            .hmac(hash_text.as_bytes(), salt_text.as_bytes(), lease.version())
            .await?;

        self.put(StorageKey::Pin(user.to_owned()), &hash_text).await?;
        self.put(StorageKey::PinSalt(user.to_owned()), &salt_text).await?;
        self.put(StorageKey::PinHmac(user.to_owned()), &tag.to_string()).await?;
        self.put(
            StorageKey::PinCreated(user.to_owned()),
            &to_millis_string(self.clock.now()),
        )
        .await?;
        tracing::debug!(key_version = lease.version(), "PIN stored");
        Ok(())
    }

    /// Check `candidate` against the stored PIN for `user`.
    ///
    /// The stored hash and salt are integrity-checked first; on a mismatch
    /// `pin_tampered` is logged and the result is `false` even for the
    /// right PIN. Returns `false` when no PIN is stored.
    ///
    /// # Errors
    ///
    /// Storage failures, a bad user id, or a hashing failure.
    pub async fn verify_pin(&self, user: &str, candidate: &str) -> Result<bool, KeystoreError> {
        validate_identifier("user id", user)?;
        let _lease = self.rotation.lease().await?;

        let hash = self.get(StorageKey::Pin(user.to_owned())).await?;
        let salt = self.get(StorageKey::PinSalt(user.to_owned())).await?;
        let tag = self.get(StorageKey::PinHmac(user.to_owned())).await?;

        let (hash, salt, tag) = match (hash, salt, tag) {
            (None, None, None) => return Ok(false),
            (Some(hash), Some(salt), Some(tag)) => (Zeroizing::new(hash), salt, tag),
            _ => {
                self.tampered(SecurityEventKind::PinTampered, user, "stored PIN is incomplete");
                return Ok(false);
            }
        };

        if !self
            .integrity
            .verify_stored(&tag, hash.as_bytes(), salt.as_bytes())
            .await?
        {
            self.tampered(
                SecurityEventKind::PinTampered,
                user,
                "PIN integrity check failed",
            );
            return Ok(false);
        }

        let (Ok(hash_bytes), Ok(salt_bytes)) = (STANDARD.decode(hash.as_bytes()), STANDARD.decode(&salt)) else {
            self.tampered(SecurityEventKind::PinTampered, user, "stored PIN is not decodable");
            return Ok(false);
        };
        let hash_bytes = Zeroizing::new(hash_bytes);
        let candidate = Zeroizing::new(candidate.as_bytes().to_vec());
        let params = self.pin_hash.clone();
        off_executor(move || verify_pin_hash(&candidate, &salt_bytes, &hash_bytes, &params)).await
    }

    /// `true` when the PIN is older than the configured age, or its
    /// creation time is unknown. Advisory only. `false` without a PIN.
    ///
    /// The comparison is strict: a PIN exactly `pinRotationDays` old does
    /// not yet need rotation; one a moment older does.
    ///
    /// # Errors
    ///
    /// Storage failures or a bad user id.
    pub async fn is_pin_rotation_needed(&self, user: &str) -> Result<bool, KeystoreError> {
        validate_identifier("user id", user)?;
        if !self.has_pin(user).await? {
            return Ok(false);
        }
        let created = self
            .get(StorageKey::PinCreated(user.to_owned()))
            .await?
            .as_deref()
            .and_then(from_millis_str);
        let needed = created.map_or(true, |created| {
            self.clock.now().signed_duration_since(created) > self.pin_rotation_age
        });
        if needed {
            self.log.user_event(
                SecurityEventKind::PinRotationRecommended,
                user,
                &format!(
                    "PIN older than {} days",
                    self.pin_rotation_age.num_days()
                ),
            );
        }
        Ok(needed)
    }

    /// `true` when a PIN hash is stored for `user`.
    ///
    /// # Errors
    ///
    /// Storage failures or a bad user id.
    pub async fn has_pin(&self, user: &str) -> Result<bool, KeystoreError> {
        validate_identifier("user id", user)?;
        Ok(self.get(StorageKey::Pin(user.to_owned())).await?.is_some())
    }

    /// Remove every PIN entry for `user`.
    ///
    /// # Errors
    ///
    /// Storage failures or a bad user id.
    pub async fn delete_pin(&self, user: &str) -> Result<(), KeystoreError> {
        validate_identifier("user id", user)?;
        for key in pin_keys(user) {
            self.delete(key).await?;
        }
        Ok(())
    }

    // ── Verification codes ─────────────────────────────────────────

    /// Generate a random six-digit code, store it, and return it for
    /// delivery to the user.
    ///
    /// # Errors
    ///
    /// See [`Self::store_verification_code`].
    pub async fn issue_verification_code(&self, user: &str) -> Result<String, KeystoreError> {
        let code = rand::thread_rng().gen_range(CODE_RANGE).to_string();
        self.store_verification_code(user, &code).await?;
        Ok(code)
    }

    /// Store `code` for `user`, expiring after the configured lifetime.
    ///
    /// # Errors
    ///
    /// `InvalidInput` unless `code` is six digits in 100000-999999;
    /// storage failures.
    pub async fn store_verification_code(&self, user: &str, code: &str) -> Result<(), KeystoreError> {
        validate_identifier("user id", user)?;
        if !is_valid_code(code) {
            return Err(KeystoreError::InvalidInput(
                "verification code must be six digits in 100000-999999".into(),
            ));
        }

        let lease = self.rotation.lease().await?;
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(self.code_ttl)
            .ok_or_else(|| KeystoreError::InvalidInput("code expiry out of range".into()))?;
        let expiry_text = to_millis_string(expires_at);
        let tag = self
            .integrity
            .hmac(
                code_tag_data(code, &expiry_text).as_bytes(),
                user.as_bytes(),
                lease.version(),
            )
            .await?;

        self.put(StorageKey::VerificationCode(user.to_owned()), code).await?;
        self.put(StorageKey::VerificationCodeExpiry(user.to_owned()), &expiry_text)
            .await?;
        self.put(StorageKey::VerificationCodeHmac(user.to_owned()), &tag.to_string())
            .await?;
        Ok(())
    }

    /// Check `candidate` against the stored code for `user`.
    ///
    /// Integrity is checked first, then expiry, then the code itself in
    /// constant time. A tampered or expired code is deleted. A wrong
    /// candidate leaves the code in place. A match does not delete the
    /// code; call [`Self::clear_verification_code`] once it has been used.
    ///
    /// # Errors
    ///
    /// Storage failures or a bad user id.
    pub async fn verify_code(&self, user: &str, candidate: &str) -> Result<bool, KeystoreError> {
        validate_identifier("user id", user)?;
        let _lease = self.rotation.lease().await?;

        let code = self.get(StorageKey::VerificationCode(user.to_owned())).await?;
        let expiry = self
            .get(StorageKey::VerificationCodeExpiry(user.to_owned()))
            .await?;
        let tag = self
            .get(StorageKey::VerificationCodeHmac(user.to_owned()))
            .await?;

        let (code, expiry, tag) = match (code, expiry, tag) {
            (None, None, None) => return Ok(false),
            (Some(code), Some(expiry), Some(tag)) => (Zeroizing::new(code), expiry, tag),
            _ => {
                self.tampered(
                    SecurityEventKind::VerificationCodeTampered,
                    user,
                    "stored verification code is incomplete",
                );
                self.clear_code_entries(user).await?;
                return Ok(false);
            }
        };

        if !self
            .integrity
            .verify_stored(&tag, code_tag_data(&code, &expiry).as_bytes(), user.as_bytes())
            .await?
        {
            self.tampered(
                SecurityEventKind::VerificationCodeTampered,
                user,
                "verification code integrity check failed",
            );
            self.clear_code_entries(user).await?;
            return Ok(false);
        }

        let expired = from_millis_str(&expiry).map_or(true, |at| self.clock.now() > at);
        if expired {
            tracing::debug!("verification code expired");
            self.clear_code_entries(user).await?;
            return Ok(false);
        }

        Ok(constant_time_eq(candidate.as_bytes(), code.as_bytes()))
    }

    /// Delete the stored verification code for `user`.
    ///
    /// # Errors
    ///
    /// Storage failures or a bad user id.
    pub async fn clear_verification_code(&self, user: &str) -> Result<(), KeystoreError> {
        validate_identifier("user id", user)?;
        self.clear_code_entries(user).await
    }

    // ── Biometric flag ─────────────────────────────────────────────

    /// Record whether biometric unlock is enabled for `user`.
    ///
    /// # Errors
    ///
    /// Storage failures or a bad user id.
    pub async fn set_biometric_enabled(&self, user: &str, enabled: bool) -> Result<(), KeystoreError> {
        validate_identifier("user id", user)?;
        self.put(
            StorageKey::BiometricEnabled(user.to_owned()),
            if enabled { "true" } else { "false" },
        )
        .await
    }

    /// Whether biometric unlock is enabled for `user`. Defaults to `false`.
    ///
    /// # Errors
    ///
    /// Storage failures or a bad user id.
    pub async fn is_biometric_enabled(&self, user: &str) -> Result<bool, KeystoreError> {
        validate_identifier("user id", user)?;
        Ok(self
            .get(StorageKey::BiometricEnabled(user.to_owned()))
            .await?
            .is_some_and(|v| v == "true"))
    }

    // ── Login attempts ─────────────────────────────────────────────

    /// Record a failed login for `identity`. Returns `true` once locked out.
    pub fn record_failed_attempt(&self, identity: &str) -> bool {
        self.attempts.record_failed_attempt(identity)
    }

    /// `true` while `identity` is locked out.
    pub fn is_locked_out(&self, identity: &str) -> bool {
        self.attempts.is_locked_out(identity)
    }

    /// Time until the lockout on `identity` lifts.
    pub fn lockout_remaining(&self, identity: &str) -> Option<TimeDelta> {
        self.attempts.lockout_remaining(identity)
    }

    /// Forget failed attempts for `identity`.
    pub fn reset_attempts(&self, identity: &str) {
        self.attempts.reset_attempts(identity);
    }

    /// The underlying limiter.
    #[must_use]
    pub const fn attempts(&self) -> &LoginAttempts {
        &self.attempts
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn tampered(&self, kind: SecurityEventKind, user: &str, details: &str) {
        self.log.user_event(kind, user, details);
    }

    async fn clear_code_entries(&self, user: &str) -> Result<(), KeystoreError> {
        for key in code_keys(user) {
            self.delete(key).await?;
        }
        Ok(())
    }

    async fn get(&self, key: StorageKey) -> Result<Option<String>, KeystoreError> {
        Ok(self.store.read(&key.to_string()).await?)
    }

    async fn put(&self, key: StorageKey, value: &str) -> Result<(), KeystoreError> {
        Ok(self.store.write(&key.to_string(), value).await?)
    }

    async fn delete(&self, key: StorageKey) -> Result<(), KeystoreError> {
        Ok(self.store.delete(&key.to_string()).await?)
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

/// `true` for six ASCII digits in 100000-999999.
#[must_use]
pub fn is_valid_code(code: &str) -> bool {
    code.len() == 6
        && code.bytes().all(|b| b.is_ascii_digit())
        && code.parse::<u32>().is_ok_and(|n| CODE_RANGE.contains(&n))
}

/// Run a CPU-heavy hashing step on the blocking pool.
async fn off_executor<T, F>(work: F) -> Result<T, KeystoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CryptoError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| CryptoError::KeyDerivation(format!("hashing task failed: {err}")))?
        .map_err(KeystoreError::from)
}

fn code_tag_data(code: &str, expiry: &str) -> String {
    format!("{code}|{expiry}")
}

fn pin_keys(user: &str) -> [StorageKey; 4] {
    [
        StorageKey::Pin(user.to_owned()),
        StorageKey::PinSalt(user.to_owned()),
        StorageKey::PinHmac(user.to_owned()),
        StorageKey::PinCreated(user.to_owned()),
    ]
}

fn code_keys(user: &str) -> [StorageKey; 3] {
    [
        StorageKey::VerificationCode(user.to_owned()),
        StorageKey::VerificationCodeExpiry(user.to_owned()),
        StorageKey::VerificationCodeHmac(user.to_owned()),
    ]
}

// ── Rotation support ───────────────────────────────────────────────

/// Counts from re-tagging credentials during a rotation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetagReport {
    /// Tags recomputed under the target version.
    pub retagged: usize,
    /// Tags already at the target version.
    pub current: usize,
    /// Tags that failed to verify and were left in place.
    pub tampered: usize,
}

/// Move every PIN and verification-code tag to `target`.
///
/// Each tag is verified under the version it records before being
/// recomputed. A tag that does not verify, or whose secret is incomplete,
/// is left untouched and reported as tampered. Runs under the rotation's
/// exclusive lock, so it must not take a lease.
pub(crate) async fn retag_credentials(
    store: &dyn SecureStore,
    integrity: &IntegrityService,
    log: &SecurityLog,
    target: u32,
) -> Result<RetagReport, KeystoreError> {
    let entries: HashMap<String, String> = store.read_all().await?.into_iter().collect();
    let lookup = |key: StorageKey| entries.get(&key.to_string());
    let mut report = RetagReport::default();

    for (raw, tag) in &entries {
        let (user, kind, input) = match StorageKey::parse(raw) {
            Some(StorageKey::PinHmac(user)) => {
                let hash = lookup(StorageKey::Pin(user.clone()));
                let salt = lookup(StorageKey::PinSalt(user.clone()));
                let input = hash.zip(salt).map(|(h, s)| (h.clone(), s.clone()));
                (user, SecurityEventKind::PinTampered, input)
            }
            Some(StorageKey::VerificationCodeHmac(user)) => {
                let code = lookup(StorageKey::VerificationCode(user.clone()));
                let expiry = lookup(StorageKey::VerificationCodeExpiry(user.clone()));
                let input = code.zip(expiry).map(|(c, e)| (code_tag_data(c, e), user.clone()));
                (user, SecurityEventKind::VerificationCodeTampered, input)
            }
            _ => continue,
        };

        if tag.parse::<IntegrityTag>().is_ok_and(|t| t.version == target) {
            report.current = report.current.saturating_add(1);
            continue;
        }

        let retagged = match input {
            Some((data, context)) => {
                integrity
                    .retag(tag, data.as_bytes(), context.as_bytes(), target)
                    .await?
            }
            None => None,
        };
        match retagged {
            Some(new_tag) => {
                store.write(raw, &new_tag.to_string()).await?;
                report.retagged = report.retagged.saturating_add(1);
            }
            None => {
                log.user_event(kind, &user, "integrity tag failed to verify during key rotation");
                report.tampered = report.tampered.saturating_add(1);
            }
        }
    }
    Ok(report)
}
