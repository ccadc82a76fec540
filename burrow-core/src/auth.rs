//! Credential helpers for agent identities

use subtle::ConstantTimeEq;
use thiserror::Error;

/// Longest accepted agent id or credential hash
pub const MAX_IDENTITY_LEN: usize = 256;

/// Constant-time comparison of two byte slices
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Check a stored credential hash against a presented one
#[must_use]
pub fn verify_credential(presented: &str, stored: &str) -> bool {
    constant_time_eq(presented.as_bytes(), stored.as_bytes())
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity is empty")]
    Empty,
    #[error("identity too long: {len} bytes exceeds maximum of {max} bytes")]
    TooLong { len: usize, max: usize },
    #[error("identity contains invalid characters")]
    InvalidCharacters,
}

/// Reject ids and hashes that are empty, oversized or contain control bytes
pub fn validate_identity(value: &str) -> Result<(), IdentityError> {
    if value.is_empty() {
        return Err(IdentityError::Empty);
    }
    if value.len() > MAX_IDENTITY_LEN {
        return Err(IdentityError::TooLong {
            len: value.len(),
            max: MAX_IDENTITY_LEN,
        });
    }
    if value.chars().any(char::is_control) {
        return Err(IdentityError::InvalidCharacters);
    }
    Ok(())
}
