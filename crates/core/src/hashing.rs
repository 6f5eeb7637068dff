//! Shared SHA-256 hex digest utility.
//!
//! Used by `descriptor` for idempotency-key derivation so the same
//! computation is not duplicated wherever keys need to be recomputed.

use sha2::{Digest, Sha256};

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}
