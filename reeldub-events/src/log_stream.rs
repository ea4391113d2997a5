//! `GET /jobs/{id}/logs/tail` and `/logs/stream`, grounded in the
//! original `web/routes/jobs_logs.py`: tail the job's `log_path`, and
//! poll-tail it live until the job reaches a terminal state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reeldub_core::{RdError, RdResult};
use reeldub_store::JobStore;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::BoxStream;

const CHANNEL_CAPACITY: usize = 256;

/// Returns up to the last `n` lines of the file at `path`. Reads the whole
/// file — job logs are bounded by the pipeline's own log rotation, not
/// meant to be tailed efficiently at gigabyte scale.
pub async fn tail_lines(path: &Path, n: usize) -> RdResult<Vec<String>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(RdError::internal("reading job log file").with_source(e.into()).into()),
    };
    let lines: Vec<String> = contents.lines().map(str::to_string).collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].to_vec())
}

/// Streams newly appended lines from `log_path` until `job_id` reaches a
/// terminal state. Each tick seeks to the last read offset, so a log that
/// is still growing is read incrementally rather than re-scanned.
pub fn stream_log(jobs: Arc<dyn JobStore>, job_id: String, log_path: PathBuf, poll_interval: Duration) -> BoxStream<RdResult<String>> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut offset: u64 = 0;
        loop {
            match read_new_lines(&log_path, &mut offset).await {
                Ok(lines) => {
                    for line in lines {
                        if tx.send(Ok(line)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }

            match jobs.get(&job_id).await {
                Ok(Some(job)) if job.state.is_terminal() => return,
                Ok(Some(_)) => {}
                Ok(None) => return,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    });
    Box::pin(ReceiverStream::new(rx))
}

async fn read_new_lines(path: &Path, offset: &mut u64) -> RdResult<Vec<String>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(RdError::internal("opening job log file").with_source(e.into()).into()),
    };
    file.seek(std::io::SeekFrom::Start(*offset)).await.map_err(|e| RdError::internal("seeking job log file").with_source(e.into()))?;

    let mut reader = BufReader::new(file);
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.map_err(|e| RdError::internal("reading job log file").with_source(e.into()))?;
        if n == 0 {
            break;
        }
        *offset += n as u64;
        if line.ends_with('\n') {
            lines.push(line.trim_end_matches(['\r', '\n']).to_string());
        } else {
            // Partial line at EOF: don't advance past it, re-read next tick.
            *offset -= n as u64;
            break;
        }
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tail_lines_returns_at_most_the_requested_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        tokio::fs::write(&path, "one\ntwo\nthree\nfour\n").await.unwrap();
        assert_eq!(tail_lines(&path, 2).await.unwrap(), vec!["three", "four"]);
        assert_eq!(tail_lines(&path, 100).await.unwrap(), vec!["one", "two", "three", "four"]);
    }

    #[tokio::test]
    async fn tail_lines_on_a_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.log");
        assert!(tail_lines(&path, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_new_lines_only_returns_complete_lines_and_does_not_advance_past_a_partial_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        tokio::fs::write(&path, "complete\npartial").await.unwrap();
        let mut offset = 0;
        let lines = read_new_lines(&path, &mut offset).await.unwrap();
        assert_eq!(lines, vec!["complete"]);
        assert_eq!(offset, "complete\n".len() as u64);
    }
}
