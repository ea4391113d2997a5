use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use reeldub_core::RdError;
use reeldub_queue::QueueError;

#[derive(Debug)]
pub struct RdWebError(pub anyhow::Error);

impl From<anyhow::Error> for RdWebError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

impl From<RdError> for RdWebError {
    fn from(e: RdError) -> Self {
        Self(e.into_anyhow())
    }
}

impl From<QueueError> for RdWebError {
    fn from(e: QueueError) -> Self {
        Self(RdError::from(e).into_anyhow())
    }
}

impl IntoResponse for RdWebError {
    fn into_response(self) -> Response {
        let rd = match RdError::from_anyhow(&self.0) {
            Some(rd) => rd.sanitize_for_client(),
            None => {
                tracing::error!(error = %self.0, "unclassified error reached the web layer");
                RdError::internal(self.0.to_string()).sanitize_for_client()
            }
        };
        let status = StatusCode::from_u16(rd.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(rd.to_json())).into_response()
    }
}

pub type RdWebResult<T> = Result<T, RdWebError>;
