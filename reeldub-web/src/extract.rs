//! Pulls the plain signals `reeldub_auth::IdentityResolver` wants out of a
//! real axum request. `reeldub-auth` deliberately stays framework-agnostic
//! (see its `identity` module doc comment), so this crate is the only one
//! that knows how to read a header or cookie off an axum request.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use reeldub_auth::{Identity, RequestSignals};

use crate::error::RdWebError;
use crate::state::AppState;

/// Finds a single cookie value by name in the raw `Cookie` header. No
/// cookie-jar crate in the stack, so this reads the same header-extraction
/// way the rest of the workspace prefers a hand-rolled helper over a new
/// dependency for a narrow, well-bounded parse.
pub(crate) fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then_some(v)
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

fn query_param<'a>(raw_query: &'a str, name: &str) -> Option<&'a str> {
    raw_query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then_some(v)
    })
}

pub fn signals_from_parts<'a>(headers: &'a HeaderMap, method: &'a str, raw_query: &'a str, peer_addr: IpAddr) -> RequestSignals<'a> {
    RequestSignals {
        api_key_header: header_str(headers, "x-api-key"),
        authorization_header: header_str(headers, axum::http::header::AUTHORIZATION.as_str()),
        session_cookie: cookie_value(headers, "session"),
        csrf_cookie: cookie_value(headers, "csrf"),
        csrf_header: header_str(headers, "x-csrf-token"),
        legacy_token_query: query_param(raw_query, "token"),
        method,
        peer_addr,
    }
}

/// An authenticated caller, resolved the same way for every handler that
/// needs one. Handlers that also need the raw request (to read a query
/// string) pull it via `Query<T>`/`OriginalUri` alongside this extractor.
pub struct AuthenticatedIdentity(pub Identity);

impl FromRequestParts<AppState> for AuthenticatedIdentity {
    type Rejection = RdWebError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let peer_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let raw_query = parts.uri.query().unwrap_or("");
        let signals = signals_from_parts(&parts.headers, parts.method.as_str(), raw_query, peer_addr);
        let identity = state.identity.resolve(&signals).await.map_err(RdWebError)?;
        Ok(AuthenticatedIdentity(identity))
    }
}

pub const ALLOW_SHARED_READ: bool = true;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn cookie_value_finds_the_named_cookie_among_several() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::COOKIE, HeaderValue::from_static("session=abc; csrf=xyz"));
        assert_eq!(cookie_value(&headers, "csrf"), Some("xyz"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn query_param_reads_a_flat_key_value_pair() {
        assert_eq!(query_param("token=abc&x=1", "token"), Some("abc"));
        assert_eq!(query_param("x=1", "token"), None);
    }
}
