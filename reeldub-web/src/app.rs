use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::routes;
use crate::state::AppState;

async fn ensure_request_id(mut req: Request<Body>, next: Next) -> Response {
    let header = HeaderName::from_static("x-request-id");

    let request_id = req
        .headers()
        .get(&header)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if req.headers().get(&header).is_none() {
        if let Ok(v) = HeaderValue::from_str(&request_id) {
            req.headers_mut().insert(header.clone(), v);
        }
    }

    let mut res = next.run(req).await;

    if res.headers().get(&header).is_none() {
        if let Ok(v) = HeaderValue::from_str(&request_id) {
            res.headers_mut().insert(header, v);
        }
    }
    res
}

fn layer_defaults(router: Router<AppState>) -> Router<AppState> {
    router.layer(middleware::from_fn(ensure_request_id)).layer(TraceLayer::new_for_http())
}

pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .merge(routes::auth::router())
        .merge(routes::uploads::router())
        .merge(routes::jobs::router())
        .merge(routes::events::router())
        .merge(routes::library::router())
        .merge(routes::admin::router());

    layer_defaults(router).with_state(state)
}
