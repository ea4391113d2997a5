//! `/auth/login`, `/auth/refresh`, `/auth/logout` — password (+ optional
//! TOTP) login, refresh-token rotation, and cookie/session teardown.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::RdWebResult;
use crate::extract::cookie_value;
use crate::routes::cookies::{clear_cookie, set_cookie, CSRF_COOKIE, REFRESH_COOKIE, SESSION_COOKIE};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
    totp_code: Option<String>,
}

#[derive(Serialize)]
struct LoginResponse {
    access_token: String,
    csrf_token: String,
}

async fn login(State(state): State<AppState>, Json(body): Json<LoginRequest>) -> RdWebResult<(HeaderMap, Json<LoginResponse>)> {
    let outcome = state.auth.login(&body.username, &body.password, body.totp_code.as_deref()).await?;

    let secure = state.config.cookie_secure;
    let mut headers = HeaderMap::new();
    headers.append(
        axum::http::header::SET_COOKIE,
        set_cookie(SESSION_COOKIE, &outcome.session_cookie, state.config.session_cookie_ttl.as_secs() as i64, true, secure),
    );
    headers.append(
        axum::http::header::SET_COOKIE,
        set_cookie(REFRESH_COOKIE, &outcome.refresh_token, state.config.refresh_token_ttl.as_secs() as i64, true, secure),
    );
    headers.append(
        axum::http::header::SET_COOKIE,
        set_cookie(CSRF_COOKIE, &outcome.csrf_token, state.config.session_cookie_ttl.as_secs() as i64, false, secure),
    );

    Ok((headers, Json(LoginResponse { access_token: outcome.access_token, csrf_token: outcome.csrf_token })))
}

async fn refresh(State(state): State<AppState>, headers_in: HeaderMap) -> RdWebResult<(HeaderMap, Json<Value>)> {
    let presented = cookie_value(&headers_in, REFRESH_COOKIE)
        .ok_or_else(|| reeldub_core::RdError::unauthenticated("no refresh cookie presented"))?;
    let outcome = state.auth.refresh(presented).await?;

    let secure = state.config.cookie_secure;
    let mut headers = HeaderMap::new();
    headers.append(
        axum::http::header::SET_COOKIE,
        set_cookie(REFRESH_COOKIE, &outcome.refresh_token, state.config.refresh_token_ttl.as_secs() as i64, true, secure),
    );

    Ok((headers, Json(json!({ "access_token": outcome.access_token }))))
}

async fn logout(State(state): State<AppState>, headers_in: HeaderMap) -> RdWebResult<(HeaderMap, Json<Value>)> {
    if let Some(presented) = cookie_value(&headers_in, REFRESH_COOKIE) {
        state.auth.logout(presented).await?;
    }

    let secure = state.config.cookie_secure;
    let mut headers = HeaderMap::new();
    headers.append(axum::http::header::SET_COOKIE, clear_cookie(SESSION_COOKIE, true, secure));
    headers.append(axum::http::header::SET_COOKIE, clear_cookie(REFRESH_COOKIE, true, secure));
    headers.append(axum::http::header::SET_COOKIE, clear_cookie(CSRF_COOKIE, false, secure));

    Ok((headers, Json(json!({}))))
}
