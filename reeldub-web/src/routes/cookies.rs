//! `Set-Cookie` construction. No cookie-jar crate in the stack (see
//! `crate::extract`'s own note), so login/refresh/logout build these by
//! hand the same narrow way `extract::cookie_value` reads them.

use axum::http::HeaderValue;

pub const SESSION_COOKIE: &str = "session";
pub const REFRESH_COOKIE: &str = "refresh";
pub const CSRF_COOKIE: &str = "csrf";

/// `http_only` is false for the CSRF cookie (the client must be able to
/// read it and echo it back in `X-CSRF-Token`) and true for everything
/// else.
pub fn set_cookie(name: &str, value: &str, max_age_s: i64, http_only: bool, secure: bool) -> HeaderValue {
    let mut out = format!("{name}={value}; Path=/; Max-Age={max_age_s}; SameSite=Lax");
    if http_only {
        out.push_str("; HttpOnly");
    }
    if secure {
        out.push_str("; Secure");
    }
    HeaderValue::from_str(&out).unwrap_or_else(|_| HeaderValue::from_static("invalid=1"))
}

/// Clears a cookie by re-setting it with an immediately-expired `Max-Age`.
pub fn clear_cookie(name: &str, http_only: bool, secure: bool) -> HeaderValue {
    set_cookie(name, "", 0, http_only, secure)
}
