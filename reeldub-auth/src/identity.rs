//! The identity resolver: turns a set of request-derived signals into
//! an [`Identity`], trying each authentication method in a fixed order
//! and stopping at the first match.
//!
//! This takes plain extracted strings rather than any web-framework
//! request type, so `reeldub-web` is the only crate that knows how to
//! pull a header or cookie out of an axum request; this crate stays
//! framework-agnostic the way the store and scheduler crates are.

use std::net::IpAddr;
use std::sync::Arc;

use reeldub_core::{RdError, RdResult};
use reeldub_store::models::ApiKey;
use reeldub_store::IdentityStore;

use crate::apikey;
use crate::jwt::JwtProvider;
use crate::rbac::{Identity, IdentityKind};
use crate::session::SessionSigner;

/// Everything the resolver needs pulled out of an inbound request.
pub struct RequestSignals<'a> {
    pub api_key_header: Option<&'a str>,
    pub authorization_header: Option<&'a str>,
    pub session_cookie: Option<&'a str>,
    pub csrf_cookie: Option<&'a str>,
    pub csrf_header: Option<&'a str>,
    pub legacy_token_query: Option<&'a str>,
    pub method: &'a str,
    pub peer_addr: IpAddr,
}

pub struct IdentityResolver {
    store: Arc<dyn IdentityStore>,
    jwt: JwtProvider,
    session: SessionSigner,
    allow_legacy_token_login: bool,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn IdentityStore>, jwt: JwtProvider, session: SessionSigner, allow_legacy_token_login: bool) -> Self {
        Self { store, jwt, session, allow_legacy_token_login }
    }

    pub async fn resolve(&self, signals: &RequestSignals<'_>) -> RdResult<Identity> {
        if let Some(presented) = extract_api_key(signals.api_key_header, signals.authorization_header) {
            return self.resolve_api_key(presented).await;
        }
        if let Some(token) = extract_bearer_jwt(signals.authorization_header) {
            return self.resolve_bearer(token).await;
        }
        if let Some(cookie) = signals.session_cookie {
            return self.resolve_session(cookie, signals).await;
        }
        if let Some(token) = signals.legacy_token_query {
            if self.allow_legacy_token_login && is_loopback_or_private(signals.peer_addr) {
                return self.resolve_bearer(token).await;
            }
        }
        Err(RdError::unauthenticated("no credentials presented").into())
    }

    async fn resolve_api_key(&self, presented: &str) -> RdResult<Identity> {
        let (prefix, secret) = apikey::split(presented).ok_or_else(|| RdError::unauthenticated("malformed api key"))?;
        let row: ApiKey = self
            .store
            .get_api_key_by_prefix(prefix)
            .await?
            .ok_or_else(|| RdError::unauthenticated("unknown api key"))?;
        if row.revoked {
            return Err(RdError::unauthenticated("api key revoked").into());
        }
        if !apikey::verify(secret, &row.key_hash) {
            return Err(RdError::unauthenticated("api key mismatch").into());
        }
        let user = self
            .store
            .get_user(&row.user_id)
            .await?
            .ok_or_else(|| RdError::unauthenticated("api key owner no longer exists"))?;
        Ok(Identity { kind: IdentityKind::ApiKey, user, scopes: row.scopes, api_key_prefix: Some(row.prefix) })
    }

    async fn resolve_bearer(&self, token: &str) -> RdResult<Identity> {
        let claims = self.jwt.verify_access_token(token)?;
        let user = self
            .store
            .get_user(&claims.sub)
            .await?
            .ok_or_else(|| RdError::unauthenticated("token subject no longer exists"))?;
        Ok(Identity { kind: IdentityKind::User, user, scopes: claims.scopes, api_key_prefix: None })
    }

    async fn resolve_session(&self, cookie: &str, signals: &RequestSignals<'_>) -> RdResult<Identity> {
        let user_id = self.session.verify(cookie)?;
        if crate::csrf::requires_csrf_check(signals.method) {
            let cookie_csrf = signals.csrf_cookie.ok_or_else(|| RdError::forbidden("missing csrf cookie"))?;
            let header_csrf = signals.csrf_header.ok_or_else(|| RdError::forbidden("missing csrf header"))?;
            if !crate::csrf::tokens_match(cookie_csrf, header_csrf) {
                return Err(RdError::forbidden("csrf token mismatch").into());
            }
        }
        let user = self
            .store
            .get_user(&user_id)
            .await?
            .ok_or_else(|| RdError::unauthenticated("session subject no longer exists"))?;
        let scopes = default_scopes_for_role(user.role);
        Ok(Identity { kind: IdentityKind::User, user, scopes, api_key_prefix: None })
    }
}

pub fn default_scopes_for_role(role: reeldub_store::models::Role) -> Vec<String> {
    use reeldub_store::models::Role;
    match role {
        Role::Admin => vec![crate::rbac::SCOPE_ADMIN_ALL.to_string()],
        Role::Operator | Role::Editor => {
            vec![crate::rbac::SCOPE_READ_JOB.to_string(), crate::rbac::SCOPE_SUBMIT_JOB.to_string()]
        }
        Role::Viewer => vec![crate::rbac::SCOPE_READ_JOB.to_string()],
    }
}

fn extract_api_key<'a>(api_key_header: Option<&'a str>, authorization_header: Option<&'a str>) -> Option<&'a str> {
    if let Some(v) = api_key_header {
        return Some(v.trim());
    }
    let bearer = authorization_header?.strip_prefix("Bearer ")?.trim();
    bearer.starts_with(apikey::RESERVED_SCHEME_PREFIX).then_some(bearer)
}

fn extract_bearer_jwt(authorization_header: Option<&str>) -> Option<&str> {
    let bearer = authorization_header?.strip_prefix("Bearer ")?.trim();
    (!bearer.starts_with(apikey::RESERVED_SCHEME_PREFIX)).then_some(bearer)
}

fn is_loopback_or_private(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.octets()[0] == 10
                || (v4.octets()[0] == 172 && (16..=31).contains(&v4.octets()[1]))
                || (v4.octets()[0] == 192 && v4.octets()[1] == 168)
        }
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_bearer_is_routed_to_api_key_extraction() {
        let header = Some("Bearer rdk_abcdefgh.somesecret");
        assert_eq!(extract_api_key(None, header), Some("rdk_abcdefgh.somesecret"));
        assert_eq!(extract_bearer_jwt(header), None);
    }

    #[test]
    fn plain_jwt_bearer_is_routed_to_jwt_extraction() {
        let header = Some("Bearer eyJhbGciOiJIUzI1NiJ9.x.y");
        assert_eq!(extract_api_key(None, header), None);
        assert_eq!(extract_bearer_jwt(header), Some("eyJhbGciOiJIUzI1NiJ9.x.y"));
    }

    #[test]
    fn private_ranges_are_recognized() {
        assert!(is_loopback_or_private("127.0.0.1".parse().unwrap()));
        assert!(is_loopback_or_private("10.1.2.3".parse().unwrap()));
        assert!(is_loopback_or_private("192.168.1.1".parse().unwrap()));
        assert!(is_loopback_or_private("172.20.0.5".parse().unwrap()));
        assert!(!is_loopback_or_private("8.8.8.8".parse().unwrap()));
    }
}
