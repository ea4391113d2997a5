//! Users, API keys, and refresh tokens.

use crate::models::{ApiKey, RefreshToken, Role, User};
use async_trait::async_trait;
use chrono::Utc;
use reeldub_core::{RdError, RdResult};
use sqlx::{Row, SqlitePool};

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn create_user(&self, user: &User) -> RdResult<()>;
    async fn get_user(&self, id: &str) -> RdResult<Option<User>>;
    async fn get_user_by_username(&self, username: &str) -> RdResult<Option<User>>;

    async fn create_api_key(&self, key: &ApiKey) -> RdResult<()>;
    async fn get_api_key_by_prefix(&self, prefix: &str) -> RdResult<Option<ApiKey>>;
    async fn revoke_api_key(&self, id: &str) -> RdResult<()>;

    async fn create_refresh_token(&self, token: &RefreshToken) -> RdResult<()>;
    async fn get_refresh_token_by_hash(&self, hash: &str) -> RdResult<Option<RefreshToken>>;
    async fn rotate_refresh_token(&self, old_id: &str, new_token: &RefreshToken) -> RdResult<()>;
    async fn revoke_refresh_token(&self, id: &str) -> RdResult<()>;
    async fn revoke_refresh_token_family(&self, user_id: &str) -> RdResult<()>;
}

pub struct SqliteIdentityStore {
    pool: SqlitePool,
}

impl SqliteIdentityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn persist_err(e: sqlx::Error) -> RdError {
    RdError::persist_failed("identity store query failed").with_source(e.into())
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<User> {
    let role: String = row.try_get("role")?;
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        role: Role::parse(&role).ok_or_else(|| anyhow::anyhow!("corrupt role column"))?,
        totp_secret: row.try_get("totp_secret")?,
        totp_enabled: row.try_get::<i64, _>("totp_enabled")? != 0,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_api_key(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<ApiKey> {
    let scopes: String = row.try_get("scopes")?;
    Ok(ApiKey {
        id: row.try_get("id")?,
        prefix: row.try_get("prefix")?,
        key_hash: row.try_get("key_hash")?,
        scopes: serde_json::from_str(&scopes).unwrap_or_default(),
        user_id: row.try_get("user_id")?,
        created_at: row.try_get("created_at")?,
        revoked: row.try_get::<i64, _>("revoked")? != 0,
    })
}

fn row_to_refresh(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<RefreshToken> {
    Ok(RefreshToken {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        token_hash: row.try_get("token_hash")?,
        issued_at: row.try_get("issued_at")?,
        expires_at: row.try_get("expires_at")?,
        revoked_at: row.try_get("revoked_at")?,
        replaced_by: row.try_get("replaced_by")?,
    })
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    async fn create_user(&self, user: &User) -> RdResult<()> {
        sqlx::query(
            "INSERT INTO users (id, username, password_hash, role, totp_secret, totp_enabled, created_at) \
             VALUES (?,?,?,?,?,?,?)",
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(&user.totp_secret)
        .bind(user.totp_enabled)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(persist_err)?;
        Ok(())
    }

    async fn get_user(&self, id: &str) -> RdResult<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(persist_err)?;
        row.as_ref()
            .map(row_to_user)
            .transpose()
            .map_err(|e| RdError::internal("corrupt user row").with_source(e).into())
    }

    async fn get_user_by_username(&self, username: &str) -> RdResult<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(persist_err)?;
        row.as_ref()
            .map(row_to_user)
            .transpose()
            .map_err(|e| RdError::internal("corrupt user row").with_source(e).into())
    }

    async fn create_api_key(&self, key: &ApiKey) -> RdResult<()> {
        sqlx::query(
            "INSERT INTO api_keys (id, prefix, key_hash, scopes, user_id, created_at, revoked) \
             VALUES (?,?,?,?,?,?,?)",
        )
        .bind(&key.id)
        .bind(&key.prefix)
        .bind(&key.key_hash)
        .bind(serde_json::to_string(&key.scopes).unwrap_or_default())
        .bind(&key.user_id)
        .bind(key.created_at)
        .bind(key.revoked)
        .execute(&self.pool)
        .await
        .map_err(persist_err)?;
        Ok(())
    }

    async fn get_api_key_by_prefix(&self, prefix: &str) -> RdResult<Option<ApiKey>> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE prefix = ?")
            .bind(prefix)
            .fetch_optional(&self.pool)
            .await
            .map_err(persist_err)?;
        row.as_ref()
            .map(row_to_api_key)
            .transpose()
            .map_err(|e| RdError::internal("corrupt api key row").with_source(e).into())
    }

    async fn revoke_api_key(&self, id: &str) -> RdResult<()> {
        sqlx::query("UPDATE api_keys SET revoked = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(persist_err)?;
        Ok(())
    }

    async fn create_refresh_token(&self, token: &RefreshToken) -> RdResult<()> {
        sqlx::query(
            "INSERT INTO refresh_tokens (id, user_id, token_hash, issued_at, expires_at, revoked_at, replaced_by) \
             VALUES (?,?,?,?,?,?,?)",
        )
        .bind(&token.id)
        .bind(&token.user_id)
        .bind(&token.token_hash)
        .bind(token.issued_at)
        .bind(token.expires_at)
        .bind(token.revoked_at)
        .bind(&token.replaced_by)
        .execute(&self.pool)
        .await
        .map_err(persist_err)?;
        Ok(())
    }

    async fn get_refresh_token_by_hash(&self, hash: &str) -> RdResult<Option<RefreshToken>> {
        let row = sqlx::query("SELECT * FROM refresh_tokens WHERE token_hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(persist_err)?;
        row.as_ref()
            .map(row_to_refresh)
            .transpose()
            .map_err(|e| RdError::internal("corrupt refresh token row").with_source(e).into())
    }

    /// Rotates `old_id` to `new_token`, recording the replacement link. A
    /// second redemption of `old_id` after this call is reuse and should be
    /// treated by the caller as grounds to revoke the whole family.
    async fn rotate_refresh_token(&self, old_id: &str, new_token: &RefreshToken) -> RdResult<()> {
        let mut tx = self.pool.begin().await.map_err(persist_err)?;
        sqlx::query("UPDATE refresh_tokens SET revoked_at = ?, replaced_by = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(&new_token.id)
            .bind(old_id)
            .execute(&mut *tx)
            .await
            .map_err(persist_err)?;
        sqlx::query(
            "INSERT INTO refresh_tokens (id, user_id, token_hash, issued_at, expires_at, revoked_at, replaced_by) \
             VALUES (?,?,?,?,?,?,?)",
        )
        .bind(&new_token.id)
        .bind(&new_token.user_id)
        .bind(&new_token.token_hash)
        .bind(new_token.issued_at)
        .bind(new_token.expires_at)
        .bind(new_token.revoked_at)
        .bind(&new_token.replaced_by)
        .execute(&mut *tx)
        .await
        .map_err(persist_err)?;
        tx.commit().await.map_err(persist_err)?;
        Ok(())
    }

    async fn revoke_refresh_token(&self, id: &str) -> RdResult<()> {
        sqlx::query("UPDATE refresh_tokens SET revoked_at = ? WHERE id = ? AND revoked_at IS NULL")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(persist_err)?;
        Ok(())
    }

    async fn revoke_refresh_token_family(&self, user_id: &str) -> RdResult<()> {
        sqlx::query("UPDATE refresh_tokens SET revoked_at = ? WHERE user_id = ? AND revoked_at IS NULL")
            .bind(Utc::now())
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(persist_err)?;
        Ok(())
    }
}
