//! Proof Key for Code Exchange (RFC 7636), S256 only.
//!
//! `challenge = BASE64URL-NOPAD(SHA256(verifier))`. The `plain` method is
//! not supported anywhere in the broker.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::digest;

use crate::error::Result;

/// The only accepted `code_challenge_method`.
pub const METHOD_S256: &str = "S256";

/// Length of a generated code verifier in bytes (before base64 encoding).
const VERIFIER_BYTES: usize = 32;

/// Derive the S256 code challenge for `verifier`.
pub fn challenge(verifier: &str) -> String {
    let hash = digest::digest(&digest::SHA256, verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash.as_ref())
}

/// Check `verifier` against a stored S256 `challenge` in constant time.
pub fn verify(verifier: &str, challenge_value: &str) -> bool {
    constant_time_eq(&challenge(verifier), challenge_value)
}

/// Generate a fresh code verifier (32 random bytes, base64url).
pub fn generate_verifier() -> Result<String> {
    Ok(calbridge_store::secret::generate_token(VERIFIER_BYTES)?)
}

fn constant_time_eq(left: &str, right: &str) -> bool {
    let left_bytes = left.as_bytes();
    let right_bytes = right.as_bytes();
    if left_bytes.len() != right_bytes.len() {
        return false;
    }

    let mut diff = 0_u8;
    for (a, b) in left_bytes.iter().zip(right_bytes.iter()) {
        diff |= *a ^ *b;
    }
    diff == 0
}
