use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

/// Infrastructure errors raised by a queue backend. Callers at the HTTP
/// boundary fold these into `RdError` via `From`.
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("invalid lease token")]
    InvalidLeaseToken,

    #[error("lease has expired")]
    LeaseExpired,

    #[error("job has been canceled")]
    JobCanceled,

    #[error("job is already in a terminal state")]
    JobAlreadyTerminal,

    #[error("queue at capacity for phase {0}")]
    Backpressure(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl From<QueueError> for reeldub_core::RdError {
    fn from(e: QueueError) -> Self {
        use reeldub_core::{ErrorKind, RdError};
        match &e {
            QueueError::JobNotFound(_) => RdError::not_found(e.to_string()),
            QueueError::JobCanceled | QueueError::JobAlreadyTerminal => {
                RdError::new(ErrorKind::Conflict, e.to_string())
            }
            QueueError::InvalidLeaseToken | QueueError::LeaseExpired => {
                RdError::new(ErrorKind::Conflict, e.to_string())
            }
            QueueError::Backpressure(phase) => {
                RdError::backpressure(format!("queue at capacity for phase {phase}"), 5.0)
            }
            QueueError::Unavailable(_) => RdError::unavailable(e.to_string()),
        }
    }
}
