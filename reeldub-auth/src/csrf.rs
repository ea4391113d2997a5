//! Double-submit CSRF check for cookie-based sessions.
//!
//! API-key and bearer-token callers skip this entirely; it only
//! applies to the `session` cookie flow, and only on methods that
//! change state.

use subtle::ConstantTimeEq;

const PROTECTED_METHODS: [&str; 4] = ["POST", "PUT", "DELETE", "PATCH"];

pub fn requires_csrf_check(method: &str) -> bool {
    PROTECTED_METHODS.contains(&method.to_ascii_uppercase().as_str())
}

pub fn tokens_match(cookie_value: &str, header_value: &str) -> bool {
    cookie_value.as_bytes().ct_eq(header_value.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_and_head_are_exempt() {
        assert!(!requires_csrf_check("GET"));
        assert!(!requires_csrf_check("HEAD"));
    }

    #[test]
    fn mutating_methods_require_the_check() {
        for m in ["post", "PUT", "Delete", "PATCH"] {
            assert!(requires_csrf_check(m));
        }
    }

    #[test]
    fn matching_and_mismatched_tokens() {
        assert!(tokens_match("abc", "abc"));
        assert!(!tokens_match("abc", "abd"));
    }
}
