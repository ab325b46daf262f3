//! Follow a job's progress stream across disconnects

use futures::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::api::ApiClient;
use super::backoff::Backoff;
use crate::stream::{ProgressEvent, ProgressSnapshot, SseParser};
use crate::types::CasebookError;

/// Errors that reconnecting cannot fix
fn is_fatal(err: &CasebookError) -> bool {
    matches!(
        err,
        CasebookError::Unauthorized(_) | CasebookError::NotFound(_) | CasebookError::BadRequest(_)
    )
}

/// Read the progress stream of `job_id` until a terminal event, reconnecting
/// with `backoff` whenever the stream drops. Every event goes to `on_event`;
/// the terminal snapshot is returned.
pub async fn follow_progress<F>(
    api: &dyn ApiClient,
    job_id: Uuid,
    backoff: &mut Backoff,
    mut on_event: F,
) -> Result<ProgressSnapshot, CasebookError>
where
    F: FnMut(&ProgressEvent) + Send,
{
    loop {
        match api.open_progress_stream(job_id).await {
            Ok(mut stream) => {
                let mut parser = SseParser::new();
                while let Some(chunk) = stream.next().await {
                    let chunk = match chunk {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            debug!(job_id = %job_id, error = %e, "Progress stream dropped");
                            break;
                        }
                    };
                    for frame in parser.feed(&chunk) {
                        let event = match ProgressEvent::from_named(frame.name(), &frame.data) {
                            Ok(Some(event)) => event,
                            Ok(None) => continue,
                            Err(e) => {
                                warn!(job_id = %job_id, error = %e, "Skipping malformed progress event");
                                continue;
                            }
                        };
                        backoff.reset();
                        on_event(&event);
                        if event.is_terminal() {
                            return Ok(event.into_snapshot());
                        }
                    }
                }
            }
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => {
                debug!(job_id = %job_id, error = %e, "Progress stream unavailable");
            }
        }

        let Some(delay) = backoff.next_delay() else {
            return Err(CasebookError::Stream(format!(
                "progress stream for {} lost after {} reconnect attempts",
                job_id,
                backoff.attempts()
            )));
        };
        warn!(job_id = %job_id, "Reconnecting progress stream in {:?}...", delay);
        tokio::time::sleep(delay).await;
    }
}
