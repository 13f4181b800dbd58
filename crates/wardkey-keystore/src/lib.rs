//! `wardkey-keystore`: the async credential and key-management core.
//!
//! Services are built around one shared [`SecureStore`]:
//!
//! - [`CipherService`] encrypts by key version and seals named secrets.
//! - [`IntegrityService`] computes and checks versioned HMAC tags.
//! - [`CredentialStore`] holds PINs, verification codes and the login
//!   attempt limiter.
//! - [`RotationManager`] owns the current key version and the
//!   rotation/rollback/emergency state machine.
//!
//! [`SecurityCore`] wires them together.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod error;

pub mod clock;
pub mod config;
pub mod events;
pub mod redact;
pub mod storage_key;
pub mod store;

pub mod attempts;
pub mod cipher_service;
pub mod credentials;
pub mod integrity_service;
pub mod keyring;
pub mod rotation;

pub mod core;

pub use crate::core::SecurityCore;
pub use attempts::LoginAttempts;
pub use cipher_service::{CipherService, SealedValue, SecretClass};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::KeystoreConfig;
pub use credentials::CredentialStore;
pub use error::{EmergencyRecoveryError, KeystoreError, RotationError, StorageError};
pub use events::{MemorySink, SecurityEvent, SecurityEventKind, SecurityEventSink, TracingSink};
pub use integrity_service::IntegrityService;
pub use keyring::KeyRing;
pub use redact::redact;
pub use rotation::{RotationManager, RotationOutcome, RotationState, VersionLease};
pub use storage_key::{KeyRole, StorageKey};
pub use store::{MemoryStore, SecureStore};
