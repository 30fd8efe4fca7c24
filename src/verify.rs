//! Integrity verification of fetched payloads
//!
//! Computes the SHA-256 digest and byte length that identify a replay in the
//! blob store and the ledger.

use crate::error::IntegrityError;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Content digest of a verified payload
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    /// Lowercase hex SHA-256 (64 characters)
    pub sha256: String,
    /// Payload length in bytes
    pub size_bytes: u64,
}

impl Digest {
    /// Whether `value` looks like a hex SHA-256 digest as stored by this crate
    ///
    /// Only lowercase hex is accepted; callers normalize user input first.
    pub fn is_valid_hex(value: &str) -> bool {
        value.len() == 64
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }
}

/// Digest `bytes`, rejecting empty payloads
pub fn verify(bytes: &[u8]) -> Result<Digest, IntegrityError> {
    if bytes.is_empty() {
        return Err(IntegrityError::EmptyPayload);
    }

    Ok(Digest {
        sha256: sha256_hex(bytes),
        size_bytes: bytes.len() as u64,
    })
}

/// Lowercase hex SHA-256 of `bytes`
pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{:02x}", byte);
    }
    hex
}
