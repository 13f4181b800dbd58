//! `wardkey-crypto-core`: pure cryptographic primitives for the wardkey
//! credential core.
//!
//! Zero storage, zero async. Everything here is a function of its
//! arguments plus the OS CSPRNG.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod error;
pub mod memory;

pub mod cipher;
pub mod integrity;
pub mod pin_hash;

pub use cipher::{decrypt, decrypt_str, encrypt, encrypt_str, EncryptedBlob};
pub use error::CryptoError;
pub use integrity::{constant_time_eq, IntegrityTag};
pub use memory::SecretBuffer;
pub use pin_hash::{generate_salt, hash_pin, verify_pin_hash, PinHashParams};
