//! Salted Argon2id hashing for PINs and other short secrets.
//!
//! This module provides:
//! - [`generate_salt`]: 16 random bytes from `OsRng`
//! - [`hash_pin`]: derive a 256-bit hash from a PIN + salt
//! - [`verify_pin_hash`]: recompute and compare in constant time
//! - [`PinHashParams`]: serializable Argon2id cost parameters

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::integrity::constant_time_eq;
use crate::memory::SecretBuffer;

/// Output length of the hash in bytes (256 bits).
pub const HASH_LEN: usize = 32;

/// Salt length in bytes.
pub const SALT_LEN: usize = 16;

/// Argon2id parameter set used for PIN hashing.
///
/// Fields use the `argon2` crate convention:
/// - `m_cost`: memory in KiB
/// - `t_cost`: number of iterations
/// - `p_cost`: degree of parallelism
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinHashParams {
    /// Memory cost in kibibytes.
    pub m_cost: u32,
    /// Number of iterations (time cost).
    pub t_cost: u32,
    /// Degree of parallelism (number of lanes).
    pub p_cost: u32,
}

impl PinHashParams {
    /// Interactive-login parameters: 19 MiB, 2 passes, 1 lane.
    #[must_use]
    pub const fn interactive() -> Self {
        Self {
            m_cost: 19_456,
            t_cost: 2,
            p_cost: 1,
        }
    }
}

impl Default for PinHashParams {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Generate a fresh random salt.
#[must_use]
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Hash `pin` with `salt` using Argon2id.
///
/// # Errors
///
/// Returns `CryptoError::KeyDerivation` if:
/// - The salt is shorter than 16 bytes
/// - The argon2 parameters are invalid
/// - The derivation itself fails (e.g., memory allocation)
pub fn hash_pin(pin: &[u8], salt: &[u8], params: &PinHashParams) -> Result<SecretBuffer, CryptoError> {
    if salt.len() < SALT_LEN {
        return Err(CryptoError::KeyDerivation(format!(
            "salt too short: {} bytes (minimum {SALT_LEN})",
            salt.len()
        )));
    }

    let argon2_params = argon2::Params::new(params.m_cost, params.t_cost, params.p_cost, Some(HASH_LEN))
        .map_err(|e| CryptoError::KeyDerivation(format!("invalid argon2 params: {e}")))?;

    let argon2 = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, argon2_params);

    let mut output = [0u8; HASH_LEN];
    argon2
        .hash_password_into(pin, salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(format!("argon2id derivation failed: {e}")))?;

    let result = SecretBuffer::new(&output);
    output.zeroize();
    Ok(result)
}

/// Hash `candidate` with `salt` and compare it with `expected_hash` in
/// constant time.
///
/// # Errors
///
/// See [`hash_pin`].
pub fn verify_pin_hash(
    candidate: &[u8],
    salt: &[u8],
    expected_hash: &[u8],
    params: &PinHashParams,
) -> Result<bool, CryptoError> {
    let actual = hash_pin(candidate, salt, params)?;
    Ok(constant_time_eq(actual.expose(), expected_hash))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
