//! Role/scope gating and object visibility rules.

use reeldub_core::{RdError, RdResult};
use reeldub_store::models::{LibraryRow, Role, User, Visibility};

pub const SCOPE_READ_JOB: &str = "read:job";
pub const SCOPE_SUBMIT_JOB: &str = "submit:job";
pub const SCOPE_ADMIN_ALL: &str = "admin:*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    User,
    ApiKey,
}

#[derive(Debug, Clone)]
pub struct Identity {
    pub kind: IdentityKind,
    pub user: User,
    pub scopes: Vec<String>,
    pub api_key_prefix: Option<String>,
}

impl Identity {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope || s == SCOPE_ADMIN_ALL)
    }

    pub fn is_admin(&self) -> bool {
        self.user.role.is_admin()
    }

    pub fn at_least_operator(&self) -> bool {
        self.user.role.at_least_operator()
    }
}

pub fn require_scope(identity: &Identity, scope: &str) -> RdResult<()> {
    if identity.has_scope(scope) {
        Ok(())
    } else {
        Err(RdError::forbidden(format!("missing scope {scope}")).into())
    }
}

pub fn require_role_at_least(identity: &Identity, min: Role) -> RdResult<()> {
    if identity.user.role.rank() >= min.rank() {
        Ok(())
    } else {
        Err(RdError::forbidden(format!("role {} does not meet required rank", identity.user.role.as_str())).into())
    }
}

/// Ownership or admin gate for any mutating job/library/artifact
/// endpoint. Visibility is never consulted here: a `shared` or
/// `public` object is exactly as writable to a non-owner as a
/// `private` one, which is to say not at all.
pub fn require_owner_or_admin(identity: &Identity, owner_id: &str) -> RdResult<()> {
    if identity.is_admin() || identity.user.id == owner_id {
        Ok(())
    } else {
        Err(RdError::forbidden("not the owner of this resource").into())
    }
}

/// The visibility rule shared by every owned, visibility-tagged object in
/// this system (library rows, jobs, presets): the owner and any admin can
/// always see it; otherwise `public` is visible to anyone, `shared` only
/// when the caller allows shared reads, and `private` never.
pub fn is_visible(identity: &Identity, owner_id: &str, visibility: Visibility, allow_shared_read: bool) -> bool {
    if identity.is_admin() || owner_id == identity.user.id {
        return true;
    }
    match visibility {
        Visibility::Private => false,
        Visibility::Public => true,
        Visibility::Shared => allow_shared_read,
    }
}

fn row_visible(identity: &Identity, row: &LibraryRow, allow_shared_read: bool) -> bool {
    is_visible(identity, &row.owner_id, row.visibility, allow_shared_read)
}

/// Refuses with `403` unless at least one of `rows` is visible to
/// `identity` under the given sharing policy.
pub fn require_library_access(identity: &Identity, rows: &[LibraryRow], allow_shared_read: bool) -> RdResult<()> {
    if rows.iter().any(|row| row_visible(identity, row, allow_shared_read)) {
        Ok(())
    } else {
        Err(RdError::forbidden("library entry is not visible to this caller").into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(id: &str, role: Role) -> User {
        User {
            id: id.to_string(),
            username: id.to_string(),
            password_hash: String::new(),
            role,
            totp_secret: None,
            totp_enabled: false,
            created_at: Utc::now(),
        }
    }

    fn identity(id: &str, role: Role, scopes: &[&str]) -> Identity {
        Identity {
            kind: IdentityKind::User,
            user: user(id, role),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            api_key_prefix: None,
        }
    }

    fn row(owner: &str, visibility: Visibility) -> LibraryRow {
        LibraryRow {
            job_id: "job_1".to_string(),
            owner_id: owner.to_string(),
            series_slug: "show".to_string(),
            series_title: "Show".to_string(),
            season_number: 1,
            episode_number: 1,
            visibility,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn admin_scope_implies_any_named_scope() {
        let id = identity("u1", Role::Viewer, &[SCOPE_ADMIN_ALL]);
        assert!(require_scope(&id, SCOPE_SUBMIT_JOB).is_ok());
    }

    #[test]
    fn non_owner_cannot_write_a_shared_or_public_row() {
        let id = identity("u2", Role::Editor, &[]);
        assert!(require_owner_or_admin(&id, "u1").is_err());
    }

    #[test]
    fn shared_row_is_visible_to_a_non_owner_when_sharing_allowed() {
        let id = identity("u2", Role::Viewer, &[]);
        let rows = [row("u1", Visibility::Shared)];
        assert!(require_library_access(&id, &rows, true).is_ok());
        assert!(require_library_access(&id, &rows, false).is_err());
    }

    #[test]
    fn private_row_is_never_visible_to_a_non_owner() {
        let id = identity("u2", Role::Viewer, &[]);
        let rows = [row("u1", Visibility::Private)];
        assert!(require_library_access(&id, &rows, true).is_err());
    }

    #[test]
    fn admin_bypasses_visibility_entirely() {
        let id = identity("u2", Role::Admin, &[]);
        let rows = [row("u1", Visibility::Private)];
        assert!(require_library_access(&id, &rows, false).is_ok());
    }
}
