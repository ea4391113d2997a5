//! Live job progress fan-out: the polling SSE stream for `/jobs/events`,
//! the single-job WebSocket stream for `/ws/jobs/{id}`, and the job log
//! tail/stream endpoints. All three are poll-based over the job store at
//! the same short interval class, per this system's scheduling model —
//! there is no separate event bus, the job store itself is the source of
//! truth.

use std::pin::Pin;

use futures_core::Stream;

pub mod job_events;
pub mod job_stream;
pub mod log_stream;

pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

pub use job_events::{JobDelta, JobEventHub};
pub use job_stream::{canonical_log_path, stream_job};
pub use log_stream::{stream_log, tail_lines};
