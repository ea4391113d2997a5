//! Signed session cookies.
//!
//! Distinct from the JWT access token: this is a plain
//! `base64(payload).base64(hmac)` pair, matching the lighter-weight
//! cookie scheme `dog-auth-local` issued alongside its bearer tokens.
//! The payload carries only a user id and an expiry; scopes are looked
//! up fresh from the store on every request rather than baked in.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reeldub_core::{RdError, RdResult};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct SessionSigner {
    secret: String,
    ttl_seconds: i64,
}

impl SessionSigner {
    pub fn new(secret: impl Into<String>, ttl_seconds: i64) -> Self {
        Self { secret: secret.into(), ttl_seconds }
    }

    pub fn issue(&self, user_id: &str) -> RdResult<String> {
        let expires_at = Utc::now().timestamp() + self.ttl_seconds;
        let payload = format!("{user_id}:{expires_at}");
        let sig = self.sign(payload.as_bytes())?;
        Ok(format!("{}.{}", URL_SAFE_NO_PAD.encode(&payload), URL_SAFE_NO_PAD.encode(sig)))
    }

    /// Returns the user id the cookie was issued for, if the signature
    /// checks out and the embedded expiry hasn't passed.
    pub fn verify(&self, cookie_value: &str) -> RdResult<String> {
        let (payload_b64, sig_b64) = cookie_value
            .split_once('.')
            .ok_or_else(|| RdError::unauthenticated("malformed session cookie"))?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| RdError::unauthenticated("malformed session cookie"))?;
        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| RdError::unauthenticated("malformed session cookie"))?;

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| RdError::internal("building session mac").with_source(e.into()))?;
        mac.update(&payload);
        mac.verify_slice(&sig).map_err(|_| RdError::unauthenticated("session signature mismatch"))?;

        let payload = String::from_utf8(payload).map_err(|_| RdError::unauthenticated("malformed session cookie"))?;
        let (user_id, expires_at) = payload
            .split_once(':')
            .ok_or_else(|| RdError::unauthenticated("malformed session cookie"))?;
        let expires_at: i64 = expires_at.parse().map_err(|_| RdError::unauthenticated("malformed session cookie"))?;
        if Utc::now().timestamp() > expires_at {
            return Err(RdError::unauthenticated("session expired").into());
        }
        Ok(user_id.to_string())
    }

    fn sign(&self, payload: &[u8]) -> RdResult<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| RdError::internal("building session mac").with_source(e.into()))?;
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_cookie_verifies_back_to_the_same_user() {
        let signer = SessionSigner::new("session-secret", 3600);
        let cookie = signer.issue("user-1").unwrap();
        assert_eq!(signer.verify(&cookie).unwrap(), "user-1");
    }

    #[test]
    fn tampered_cookie_is_rejected() {
        let signer = SessionSigner::new("session-secret", 3600);
        let mut cookie = signer.issue("user-1").unwrap();
        cookie.push('x');
        assert!(signer.verify(&cookie).is_err());
    }

    #[test]
    fn expired_cookie_is_rejected() {
        let signer = SessionSigner::new("session-secret", -1);
        let cookie = signer.issue("user-1").unwrap();
        assert!(signer.verify(&cookie).is_err());
    }
}
