//! API key generation and constant-time verification.
//!
//! A key is `{prefix}.{secret}`. The prefix is stored in cleartext so
//! `GET /auth/api-keys` can look a row up before any hashing happens;
//! only `sha256(secret)` is persisted, and the comparison against it
//! runs through `subtle` so a timing side channel can't shorten a
//! brute-force search one byte at a time.

use reeldub_core::ids::{new_api_key_prefix, new_api_key_secret};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub const RESERVED_SCHEME_PREFIX: &str = "rdk_";

pub struct GeneratedApiKey {
    pub prefix: String,
    pub full_key: String,
    pub key_hash: String,
}

/// Mints a new key: a public prefix plus a secret half, returning the
/// full presentable string alongside the hash to persist.
pub fn generate() -> GeneratedApiKey {
    let prefix = new_api_key_prefix();
    let secret = new_api_key_secret();
    let full_key = format!("{prefix}.{secret}");
    GeneratedApiKey { prefix, key_hash: hash_secret(&secret), full_key }
}

pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Splits a presented key into `(prefix, secret)`, used to look up the
/// stored row before verifying.
pub fn split(presented: &str) -> Option<(&str, &str)> {
    presented.split_once('.')
}

pub fn verify(presented_secret: &str, stored_hash: &str) -> bool {
    let presented_hash = hash_secret(presented_secret);
    presented_hash.as_bytes().ct_eq(stored_hash.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_round_trips_through_split_and_verify() {
        let generated = generate();
        let (prefix, secret) = split(&generated.full_key).unwrap();
        assert_eq!(prefix, generated.prefix);
        assert!(verify(secret, &generated.key_hash));
        assert!(!verify("not-the-secret", &generated.key_hash));
    }
}
