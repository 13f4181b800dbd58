//! HMAC-SHA256 integrity tags for stored secrets.
//!
//! A tag authenticates `data` under a master key, scoped by a context
//! string (a salt, a user id). The context is length-prefixed so that
//! `("ab", "c")` and `("a", "bc")` never collide.
//!
//! Stored tags carry the key version they were computed with:
//!
//! ```text
//! v<version>:<base64 HMAC-SHA256>
//! ```

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ring::hmac;
use subtle::ConstantTimeEq;

use crate::error::CryptoError;

/// HMAC-SHA256 output length in bytes.
pub const DIGEST_LEN: usize = 32;

/// Minimum accepted master key length in bytes.
pub const MIN_KEY_LEN: usize = 32;

fn signing_key(master_key: &[u8]) -> Result<hmac::Key, CryptoError> {
    if master_key.len() < MIN_KEY_LEN {
        return Err(CryptoError::InvalidKeyMaterial(format!(
            "HMAC key too short: {} bytes (minimum {MIN_KEY_LEN})",
            master_key.len()
        )));
    }
    Ok(hmac::Key::new(hmac::HMAC_SHA256, master_key))
}

fn context_prefix(context: &[u8]) -> Result<[u8; 4], CryptoError> {
    u32::try_from(context.len())
        .map(u32::to_be_bytes)
        .map_err(|_| CryptoError::InvalidKeyMaterial("HMAC context too long".into()))
}

/// Compute `HMAC-SHA256(master_key, len(context) || context || data)`.
///
/// # Errors
///
/// Returns `CryptoError::InvalidKeyMaterial` if the key is shorter than
/// 32 bytes or the context does not fit a `u32` length prefix.
pub fn compute(master_key: &[u8], data: &[u8], context: &[u8]) -> Result<[u8; DIGEST_LEN], CryptoError> {
    let key = signing_key(master_key)?;
    let mut ctx = hmac::Context::with_key(&key);
    ctx.update(&context_prefix(context)?);
    ctx.update(context);
    ctx.update(data);
    let tag = ctx.sign();

    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(tag.as_ref());
    Ok(out)
}

/// Recompute the tag for `data` and compare it with `expected` in constant time.
///
/// The comparison cost does not depend on where the first mismatching
/// byte sits. A length mismatch returns `false`.
///
/// # Errors
///
/// Same as [`compute`]; a mismatch is `Ok(false)`, never an error.
pub fn verify(master_key: &[u8], expected: &[u8], data: &[u8], context: &[u8]) -> Result<bool, CryptoError> {
    let actual = compute(master_key, data, context)?;
    Ok(constant_time_eq(&actual, expected))
}

/// Constant-time byte comparison.
///
/// Returns `true` iff both slices have equal length and identical contents.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

// ---------------------------------------------------------------------------
// Versioned tag
// ---------------------------------------------------------------------------

/// An HMAC digest together with the key version that produced it.
#[derive(Clone, PartialEq, Eq)]
pub struct IntegrityTag {
    /// Key version whose HMAC master key computed the digest.
    pub version: u32,
    /// Raw HMAC-SHA256 digest.
    pub digest: [u8; DIGEST_LEN],
}

impl IntegrityTag {
    /// Compute a tag under `master_key`, recording `version`.
    ///
    /// # Errors
    ///
    /// See [`compute`].
    pub fn compute(version: u32, master_key: &[u8], data: &[u8], context: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            version,
            digest: compute(master_key, data, context)?,
        })
    }

    /// Check this tag against `data` under `master_key` in constant time.
    ///
    /// # Errors
    ///
    /// See [`compute`].
    pub fn verify(&self, master_key: &[u8], data: &[u8], context: &[u8]) -> Result<bool, CryptoError> {
        verify(master_key, &self.digest, data, context)
    }
}

impl fmt::Display for IntegrityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}:{}", self.version, STANDARD.encode(self.digest))
    }
}

impl fmt::Debug for IntegrityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IntegrityTag(v{})", self.version)
    }
}

impl FromStr for IntegrityTag {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || CryptoError::MalformedBlob("integrity tag is not v<n>:<base64>".into());

        let (version, encoded) = s
            .strip_prefix('v')
            .and_then(|rest| rest.split_once(':'))
            .ok_or_else(malformed)?;
        let version: u32 = version.parse().map_err(|_| malformed())?;
        if version == 0 {
            return Err(malformed());
        }
        let raw = STANDARD.decode(encoded).map_err(|_| malformed())?;
        let digest: [u8; DIGEST_LEN] = raw.as_slice().try_into().map_err(|_| malformed())?;

        Ok(Self { version, digest })
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];
    const OTHER_KEY: [u8; 32] = [0x24; 32];

    #[test]
    fn compute_is_deterministic() {
        let a = compute(&KEY, b"hash", b"salt").unwrap();
        let b = compute(&KEY, b"hash", b"salt").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn verify_accepts_matching_digest() {
        let digest = compute(&KEY, b"123456", b"user-1").unwrap();
        assert!(verify(&KEY, &digest, b"123456", b"user-1").unwrap());
    }

    #[test]
    fn verify_rejects_other_context() {
        let digest = compute(&KEY, b"123456", b"user-1").unwrap();
        assert!(!verify(&KEY, &digest, b"123456", b"user-2").unwrap());
    }

    #[test]
    fn verify_rejects_other_key() {
        let digest = compute(&KEY, b"data", b"ctx").unwrap();
        assert!(!verify(&OTHER_KEY, &digest, b"data", b"ctx").unwrap());
    }

    #[test]
    fn context_boundary_is_unambiguous() {
        let a = compute(&KEY, b"c", b"ab").unwrap();
        let b = compute(&KEY, b"bc", b"a").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn verify_rejects_truncated_digest() {
        let digest = compute(&KEY, b"data", b"ctx").unwrap();
        assert!(!verify(&KEY, &digest[..16], b"data", b"ctx").unwrap());
    }

    #[test]
    fn short_key_is_rejected() {
        assert!(matches!(
            compute(&[0u8; 16], b"data", b"ctx"),
            Err(CryptoError::InvalidKeyMaterial(_))
        ));
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn tag_display_parse_roundtrip() {
        let tag = IntegrityTag::compute(7, &KEY, b"data", b"ctx").unwrap();
        let rendered = tag.to_string();
        assert!(rendered.starts_with("v7:"));
        let parsed: IntegrityTag = rendered.parse().unwrap();
        assert_eq!(parsed, tag);
        assert!(parsed.verify(&KEY, b"data", b"ctx").unwrap());
    }

    #[test]
    fn tag_parse_rejects_garbage() {
        for bad in ["", "v", "v1", "v0:AAAA", "x1:AAAA", "v1:not-base64!", "v1:AAAA", "vx:AAAA"] {
            assert!(bad.parse::<IntegrityTag>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn tag_debug_hides_digest() {
        let tag = IntegrityTag::compute(2, &KEY, b"data", b"ctx").unwrap();
        assert_eq!(format!("{tag:?}"), "IntegrityTag(v2)");
    }
}
