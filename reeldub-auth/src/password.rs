//! Password hashing, matching `dog-auth-local`'s bcrypt hook.

use reeldub_core::{RdError, RdResult};

const DEFAULT_COST: u32 = bcrypt::DEFAULT_COST;

pub fn hash(password: &str) -> RdResult<String> {
    bcrypt::hash(password, DEFAULT_COST).map_err(|e| RdError::internal("hashing password").with_source(e.into()))
}

pub fn verify(password: &str, hash: &str) -> RdResult<bool> {
    bcrypt::verify(password, hash).map_err(|e| RdError::internal("verifying password").with_source(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_a_matching_password_and_rejects_a_wrong_one() {
        let hashed = hash("correct horse battery staple").unwrap();
        assert!(verify("correct horse battery staple", &hashed).unwrap());
        assert!(!verify("wrong password", &hashed).unwrap());
    }
}
