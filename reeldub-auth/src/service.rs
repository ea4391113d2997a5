//! Login, refresh, and logout orchestration — the handler-facing facade
//! that ties together password/TOTP checks, access-token issuance, and
//! refresh-token rotation with reuse detection.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use reeldub_core::{ids::short_id, RdError, RdResult};
use reeldub_store::models::{RefreshToken, User};
use reeldub_store::IdentityStore;
use sha2::{Digest, Sha256};

use crate::identity::default_scopes_for_role;
use crate::jwt::JwtProvider;
use crate::password;
use crate::session::SessionSigner;
use crate::totp;

pub struct LoginOutcome {
    pub access_token: String,
    pub refresh_token: String,
    pub session_cookie: String,
    pub csrf_token: String,
    pub user: User,
}

pub struct RefreshOutcome {
    pub access_token: String,
    pub refresh_token: String,
}

pub struct AuthService {
    store: Arc<dyn IdentityStore>,
    jwt: JwtProvider,
    session: SessionSigner,
    refresh_token_ttl: ChronoDuration,
}

fn hash_opaque_token(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl AuthService {
    pub fn new(store: Arc<dyn IdentityStore>, jwt: JwtProvider, session: SessionSigner, refresh_token_ttl: ChronoDuration) -> Self {
        Self { store, jwt, session, refresh_token_ttl }
    }

    pub async fn login(&self, username: &str, password_attempt: &str, totp_code: Option<&str>) -> RdResult<LoginOutcome> {
        let user = self
            .store
            .get_user_by_username(username)
            .await?
            .ok_or_else(|| RdError::unauthenticated("invalid username or password"))?;

        if !password::verify(password_attempt, &user.password_hash)? {
            tracing::warn!(username, "login rejected: bad password");
            return Err(RdError::unauthenticated("invalid username or password").into());
        }

        if user.totp_enabled {
            let secret = user.totp_secret.as_deref().ok_or_else(|| RdError::internal("totp enabled with no secret stored"))?;
            let code = totp_code.ok_or_else(|| RdError::unauthenticated("totp code required"))?;
            if !totp::verify(secret, code, Utc::now().timestamp()) {
                tracing::warn!(username, "login rejected: bad totp code");
                return Err(RdError::unauthenticated("invalid totp code").into());
            }
        }

        let scopes = default_scopes_for_role(user.role);
        let access_token = self.jwt.issue_access_token(&user.id, &scopes)?;
        let refresh_token = self.issue_refresh_token(&user.id).await?;
        let session_cookie = self.session.issue(&user.id)?;
        let csrf_token = short_id(32);

        tracing::info!(user_id = %user.id, "login succeeded");
        Ok(LoginOutcome { access_token, refresh_token, session_cookie, csrf_token, user })
    }

    /// Rotates a presented refresh token. A token already rotated away or
    /// revoked is treated as reuse: the whole family is revoked and the
    /// caller gets back `UNAUTHENTICATED`, forcing a fresh login.
    pub async fn refresh(&self, presented_refresh_token: &str) -> RdResult<RefreshOutcome> {
        let hash = hash_opaque_token(presented_refresh_token);
        let current = self
            .store
            .get_refresh_token_by_hash(&hash)
            .await?
            .ok_or_else(|| RdError::unauthenticated("unknown refresh token"))?;

        if current.revoked_at.is_some() || current.replaced_by.is_some() {
            tracing::warn!(user_id = %current.user_id, "refresh token reuse detected, revoking family");
            self.store.revoke_refresh_token_family(&current.user_id).await?;
            return Err(RdError::unauthenticated("refresh token reuse detected").into());
        }
        if current.expires_at < Utc::now() {
            return Err(RdError::unauthenticated("refresh token expired").into());
        }

        let user = self
            .store
            .get_user(&current.user_id)
            .await?
            .ok_or_else(|| RdError::unauthenticated("refresh token subject no longer exists"))?;

        let (new_secret, new_row) = self.build_refresh_token(&user.id);
        self.store.rotate_refresh_token(&current.id, &new_row).await?;

        let scopes = default_scopes_for_role(user.role);
        let access_token = self.jwt.issue_access_token(&user.id, &scopes)?;
        Ok(RefreshOutcome { access_token, refresh_token: new_secret })
    }

    pub async fn logout(&self, presented_refresh_token: &str) -> RdResult<()> {
        let hash = hash_opaque_token(presented_refresh_token);
        if let Some(token) = self.store.get_refresh_token_by_hash(&hash).await? {
            self.store.revoke_refresh_token(&token.id).await?;
        }
        Ok(())
    }

    async fn issue_refresh_token(&self, user_id: &str) -> RdResult<String> {
        let (secret, row) = self.build_refresh_token(user_id);
        self.store.create_refresh_token(&row).await?;
        Ok(secret)
    }

    fn build_refresh_token(&self, user_id: &str) -> (String, RefreshToken) {
        let secret = short_id(48);
        let now = Utc::now();
        let row = RefreshToken {
            id: format!("rt_{}", short_id(16)),
            user_id: user_id.to_string(),
            token_hash: hash_opaque_token(&secret),
            issued_at: now,
            expires_at: now + self.refresh_token_ttl,
            revoked_at: None,
            replaced_by: None,
        };
        (secret, row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reeldub_store::models::{ApiKey, Role};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeIdentityStore {
        users: Mutex<Vec<User>>,
        refresh_tokens: Mutex<Vec<RefreshToken>>,
    }

    #[async_trait]
    impl IdentityStore for FakeIdentityStore {
        async fn create_user(&self, user: &User) -> RdResult<()> {
            self.users.lock().unwrap().push(user.clone());
            Ok(())
        }
        async fn get_user(&self, id: &str) -> RdResult<Option<User>> {
            Ok(self.users.lock().unwrap().iter().find(|u| u.id == id).cloned())
        }
        async fn get_user_by_username(&self, username: &str) -> RdResult<Option<User>> {
            Ok(self.users.lock().unwrap().iter().find(|u| u.username == username).cloned())
        }
        async fn create_api_key(&self, _key: &ApiKey) -> RdResult<()> {
            Ok(())
        }
        async fn get_api_key_by_prefix(&self, _prefix: &str) -> RdResult<Option<ApiKey>> {
            Ok(None)
        }
        async fn revoke_api_key(&self, _id: &str) -> RdResult<()> {
            Ok(())
        }
        async fn create_refresh_token(&self, token: &RefreshToken) -> RdResult<()> {
            self.refresh_tokens.lock().unwrap().push(token.clone());
            Ok(())
        }
        async fn get_refresh_token_by_hash(&self, hash: &str) -> RdResult<Option<RefreshToken>> {
            Ok(self.refresh_tokens.lock().unwrap().iter().find(|t| t.token_hash == hash).cloned())
        }
        async fn rotate_refresh_token(&self, old_id: &str, new_token: &RefreshToken) -> RdResult<()> {
            let mut tokens = self.refresh_tokens.lock().unwrap();
            if let Some(old) = tokens.iter_mut().find(|t| t.id == old_id) {
                old.revoked_at = Some(Utc::now());
                old.replaced_by = Some(new_token.id.clone());
            }
            tokens.push(new_token.clone());
            Ok(())
        }
        async fn revoke_refresh_token(&self, id: &str) -> RdResult<()> {
            let mut tokens = self.refresh_tokens.lock().unwrap();
            if let Some(t) = tokens.iter_mut().find(|t| t.id == id) {
                t.revoked_at = Some(Utc::now());
            }
            Ok(())
        }
        async fn revoke_refresh_token_family(&self, user_id: &str) -> RdResult<()> {
            let mut tokens = self.refresh_tokens.lock().unwrap();
            for t in tokens.iter_mut().filter(|t| t.user_id == user_id) {
                t.revoked_at = Some(Utc::now());
            }
            Ok(())
        }
    }

    fn service(store: Arc<FakeIdentityStore>) -> AuthService {
        AuthService::new(
            store,
            JwtProvider::new("test-secret-at-least-16-bytes", "reeldub", "reeldub-api", 900),
            SessionSigner::new("session-secret", 3600),
            ChronoDuration::days(14),
        )
    }

    async fn seed_user(store: &FakeIdentityStore, username: &str, plaintext_password: &str) -> User {
        let user = User {
            id: format!("user_{username}"),
            username: username.to_string(),
            password_hash: password::hash(plaintext_password).unwrap(),
            role: Role::Editor,
            totp_secret: None,
            totp_enabled: false,
            created_at: Utc::now(),
        };
        store.create_user(&user).await.unwrap();
        user
    }

    #[tokio::test]
    async fn login_rejects_wrong_password() {
        let store = Arc::new(FakeIdentityStore::default());
        seed_user(&store, "alice", "correct horse").await;
        let svc = service(store);
        assert!(svc.login("alice", "wrong horse", None).await.is_err());
    }

    #[tokio::test]
    async fn login_then_refresh_rotates_the_token() {
        let store = Arc::new(FakeIdentityStore::default());
        seed_user(&store, "alice", "correct horse").await;
        let svc = service(store);

        let login = svc.login("alice", "correct horse", None).await.unwrap();
        let refreshed = svc.refresh(&login.refresh_token).await.unwrap();
        assert_ne!(refreshed.refresh_token, login.refresh_token);

        // The old token was consumed; reusing it now is caught as reuse.
        assert!(svc.refresh(&login.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn reusing_a_rotated_refresh_token_revokes_the_whole_family() {
        let store = Arc::new(FakeIdentityStore::default());
        seed_user(&store, "alice", "correct horse").await;
        let svc = service(store);

        let login = svc.login("alice", "correct horse", None).await.unwrap();
        let refreshed = svc.refresh(&login.refresh_token).await.unwrap();
        assert!(svc.refresh(&login.refresh_token).await.is_err());
        // Even the freshly-rotated token is now revoked as part of the family.
        assert!(svc.refresh(&refreshed.refresh_token).await.is_err());
    }
}
