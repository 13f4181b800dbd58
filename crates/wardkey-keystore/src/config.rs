//! Keystore tuning, stored as plain JSON next to the application data.
//!
//! Nothing in here is secret. The file is optional; every field falls
//! back to its default, and a corrupt file yields the full default set.

use std::fs;
use std::path::Path;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use wardkey_crypto_core::PinHashParams;

use crate::error::KeystoreError;

/// Tunable intervals and limits for the credential core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeystoreConfig {
    /// Days between scheduled key rotations.
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval_days: u32,

    /// PIN age in days after which a change is recommended.
    #[serde(default = "default_pin_rotation")]
    pub pin_rotation_days: u32,

    /// Lifetime of an issued verification code.
    #[serde(default = "default_code_ttl")]
    pub verification_code_ttl_minutes: u32,

    /// Failed attempts inside the window that trigger a lockout.
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,

    /// Sliding window (and lockout duration) for failed attempts.
    #[serde(default = "default_lockout_window")]
    pub lockout_window_minutes: u32,

    /// Upper bound on identities tracked by the attempt limiter.
    #[serde(default = "default_max_tracked_identities")]
    pub max_tracked_identities: u32,

    /// Argon2id cost for PIN hashing.
    #[serde(default)]
    pub pin_hash: PinHashParams,
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self {
            rotation_interval_days: default_rotation_interval(),
            pin_rotation_days: default_pin_rotation(),
            verification_code_ttl_minutes: default_code_ttl(),
            max_failed_attempts: default_max_failed_attempts(),
            lockout_window_minutes: default_lockout_window(),
            max_tracked_identities: default_max_tracked_identities(),
            pin_hash: PinHashParams::default(),
        }
    }
}

const fn default_rotation_interval() -> u32 {
    30
}
const fn default_pin_rotation() -> u32 {
    90
}
const fn default_code_ttl() -> u32 {
    10
}
const fn default_max_failed_attempts() -> u32 {
    5
}
const fn default_lockout_window() -> u32 {
    15
}
const fn default_max_tracked_identities() -> u32 {
    1024
}

// ── Derived durations ──────────────────────────────────────────────

impl KeystoreConfig {
    /// Rotation interval as a duration.
    #[must_use]
    pub fn rotation_interval(&self) -> TimeDelta {
        TimeDelta::days(i64::from(self.rotation_interval_days))
    }

    /// PIN age threshold as a duration.
    #[must_use]
    pub fn pin_rotation_age(&self) -> TimeDelta {
        TimeDelta::days(i64::from(self.pin_rotation_days))
    }

    /// Verification code lifetime as a duration.
    #[must_use]
    pub fn verification_code_ttl(&self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.verification_code_ttl_minutes))
    }

    /// Failed-attempt window as a duration.
    #[must_use]
    pub fn lockout_window(&self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.lockout_window_minutes))
    }

    /// Reject configurations the services cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`KeystoreError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), KeystoreError> {
        let checks = [
            ("rotationIntervalDays", self.rotation_interval_days),
            ("pinRotationDays", self.pin_rotation_days),
            ("verificationCodeTtlMinutes", self.verification_code_ttl_minutes),
            ("maxFailedAttempts", self.max_failed_attempts),
            ("lockoutWindowMinutes", self.lockout_window_minutes),
            ("maxTrackedIdentities", self.max_tracked_identities),
        ];
        if let Some((field, _)) = checks.iter().find(|(_, value)| *value == 0) {
            return Err(KeystoreError::Config(format!("{field} must be greater than zero")));
        }
        if self.pin_hash.t_cost == 0 || self.pin_hash.p_cost == 0 {
            return Err(KeystoreError::Config(
                "pinHash tCost and pCost must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

// ── File I/O ───────────────────────────────────────────────────────

const CONFIG_FILE: &str = "keystore.json";

impl KeystoreConfig {
    /// Load `{data_dir}/keystore.json`.
    ///
    /// Returns [`Default::default()`] when the file is missing or is not
    /// valid JSON.
    #[must_use]
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join(CONFIG_FILE);
        fs::read_to_string(&path).map_or_else(
            |_| Self::default(),
            |contents| serde_json::from_str(&contents).unwrap_or_default(),
        )
    }

    /// Persist to `{data_dir}/keystore.json` via write-to-tmp then rename.
    ///
    /// # Errors
    ///
    /// Returns an `io::Error` if the directory does not exist or the
    /// file system rejects the write/rename.
    pub fn save(&self, data_dir: &Path) -> std::io::Result<()> {
        let path = data_dir.join(CONFIG_FILE);
        let tmp = data_dir.join(".keystore.json.tmp");

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        fs::write(&tmp, &json)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }

        fs::rename(&tmp, &path)?;

        Ok(())
    }
}
