//! Access-token issuance and verification.
//!
//! Access tokens are HS256 JWTs carrying `sub`/`scopes`/`iat`/`exp`/
//! `iss`/`aud`/`jti`/`typ`, matching the claim shape the teacher's own
//! JWT provider produced, now fixed to one algorithm and one token kind
//! (refresh tokens are opaque, not JWTs — see [`crate::refresh`]).

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use reeldub_core::{RdError, RdResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub scopes: Vec<String>,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
    pub jti: String,
    pub typ: String,
}

#[derive(Clone)]
pub struct JwtProvider {
    secret: String,
    issuer: String,
    audience: String,
    ttl_seconds: i64,
}

impl JwtProvider {
    pub fn new(secret: impl Into<String>, issuer: impl Into<String>, audience: impl Into<String>, ttl_seconds: i64) -> Self {
        Self { secret: secret.into(), issuer: issuer.into(), audience: audience.into(), ttl_seconds }
    }

    pub fn issue_access_token(&self, user_id: &str, scopes: &[String]) -> RdResult<String> {
        let now = Utc::now().timestamp();
        let claims = AccessClaims {
            sub: user_id.to_string(),
            scopes: scopes.to_vec(),
            iat: now,
            exp: now + self.ttl_seconds,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            jti: reeldub_core::ids::short_id(24),
            typ: "access".to_string(),
        };
        let mut header = Header::new(Algorithm::HS256);
        header.typ = Some("JWT".to_string());
        encode(&header, &claims, &EncodingKey::from_secret(self.secret.as_bytes()))
            .map_err(|e| RdError::internal("signing access token").with_source(e.into()))
    }

    pub fn verify_access_token(&self, token: &str) -> RdResult<AccessClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.audience.as_str()]);

        let decoded = decode::<AccessClaims>(token, &DecodingKey::from_secret(self.secret.as_bytes()), &validation)
            .map_err(|e| RdError::unauthenticated(format!("invalid access token: {e}")))?;

        if decoded.claims.typ != "access" {
            return Err(RdError::unauthenticated("token is not an access token").into());
        }
        Ok(decoded.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> JwtProvider {
        JwtProvider::new("test-secret-at-least-16-bytes", "reeldub", "reeldub-api", 900)
    }

    #[test]
    fn round_trips_claims() {
        let token = provider().issue_access_token("user-1", &["read:job".to_string()]).unwrap();
        let claims = provider().verify_access_token(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.scopes, vec!["read:job".to_string()]);
        assert_eq!(claims.typ, "access");
    }

    #[test]
    fn rejects_token_from_a_different_audience() {
        let token = provider().issue_access_token("user-1", &[]).unwrap();
        let other = JwtProvider::new("test-secret-at-least-16-bytes", "reeldub", "someone-else", 900);
        assert!(other.verify_access_token(&token).is_err());
    }
}
