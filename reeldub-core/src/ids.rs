//! Short, URL-safe opaque identifiers.
//!
//! Job ids and upload ids are meant to show up in URLs
//! (`/jobs/{id}`, `/uploads/{id}/chunk`) so we use a short base62
//! alphabet instead of a full UUID.

use rand::Rng;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a random, URL-safe id of the given length.
pub fn short_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}

/// A job id: 16 base62 characters, prefixed so log lines are greppable.
pub fn new_job_id() -> String {
    format!("job_{}", short_id(16))
}

/// An upload session id.
pub fn new_upload_id() -> String {
    format!("up_{}", short_id(16))
}

/// An API key id / prefix pair uses this for the non-secret lookup prefix.
pub fn new_api_key_prefix() -> String {
    format!("rdk_{}", short_id(8))
}

/// The secret part of an API key, shown to the user exactly once.
pub fn new_api_key_secret() -> String {
    short_id(32)
}
