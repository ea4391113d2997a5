//! Live job fan-out: the all-jobs SSE stream and the single-job
//! WebSocket stream, both backed by polling the job store.

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use reeldub_auth::is_visible;
use reeldub_core::RdError;

use crate::error::RdWebResult;
use crate::extract::{AuthenticatedIdentity, ALLOW_SHARED_READ};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/jobs/events", get(job_events)).route("/ws/jobs/{id}", get(ws_job))
}

async fn job_events(
    State(state): State<AppState>,
    identity: AuthenticatedIdentity,
) -> Sse<impl futures_core::Stream<Item = Result<Event, axum::Error>>> {
    let deltas = state.events.subscribe(identity.0, ALLOW_SHARED_READ);
    let events = tokio_stream::StreamExt::map(deltas, |delta| Event::default().json_data(&delta).map_err(axum::Error::new));
    Sse::new(events)
}

async fn ws_job(
    State(state): State<AppState>,
    identity: AuthenticatedIdentity,
    Path(job_id): Path<String>,
    ws: WebSocketUpgrade,
) -> RdWebResult<Response> {
    let job = state.store.jobs.get(&job_id).await?.ok_or_else(|| RdError::not_found("job not found"))?;
    if !is_visible(&identity.0, &job.owner_id, job.visibility, ALLOW_SHARED_READ) {
        return Err(RdError::forbidden("job is not visible to this caller").into());
    }

    let jobs = state.store.jobs.clone();
    Ok(ws.on_upgrade(move |socket| stream_job_over_socket(socket, jobs, job_id)))
}

async fn stream_job_over_socket(mut socket: axum::extract::ws::WebSocket, jobs: std::sync::Arc<dyn reeldub_store::JobStore>, job_id: String) {
    let mut stream = reeldub_events::stream_job(jobs, job_id, std::time::Duration::from_millis(750));
    while let Some(item) = tokio_stream::StreamExt::next(&mut stream).await {
        let text = match item.and_then(|job| serde_json::to_string(&job).map_err(Into::into)) {
            Ok(text) => text,
            Err(e) => {
                let _ = socket.send(Message::Text(format!("{{\"error\":\"{e}\"}}").into())).await;
                break;
            }
        };
        if socket.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
    let _ = socket.close().await;
}
