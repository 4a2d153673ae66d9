//! Random credential generation and irreversible hashing.
//!
//! Every bearer value the broker hands out (client ids, correlation states,
//! authorization codes, access/refresh tokens, legacy API keys) is produced
//! here from the `ring` system CSPRNG. Only the SHA-256 hex digest of a
//! secret is ever written to the database.

use std::fmt::Write as _;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{StoreError, StoreResult};

/// Prefix carried by every legacy long-lived API key.
pub const API_KEY_PREFIX: &str = "gcal_";

/// Number of random bytes behind a legacy API key.
const API_KEY_BYTES: usize = 32;

/// Fill a fresh buffer of `len` bytes from the system CSPRNG.
pub fn random_bytes(len: usize) -> StoreResult<Vec<u8>> {
    let rng = SystemRandom::new();
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf).map_err(|_| StoreError::Random)?;
    Ok(buf)
}

/// Generate an opaque token of `len` random bytes, base64url encoded
/// without padding.
pub fn generate_token(len: usize) -> StoreResult<String> {
    Ok(URL_SAFE_NO_PAD.encode(random_bytes(len)?))
}

/// Generate a legacy API key: `gcal_` followed by 64 hex characters.
pub fn generate_api_key() -> StoreResult<String> {
    Ok(format!(
        "{API_KEY_PREFIX}{}",
        to_hex(&random_bytes(API_KEY_BYTES)?)
    ))
}

/// Hex-encoded SHA-256 digest of `secret`.
///
/// Hashes are deterministic so a presented secret can be looked up by its
/// digest; the raw value cannot be recovered from what is stored.
pub fn hash_secret(secret: &str) -> String {
    let hash = digest::digest(&digest::SHA256, secret.as_bytes());
    to_hex(hash.as_ref())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
}
