//! HTTP Routes for case study jobs
//!
//! - POST   /case-study/generate         - Create a job, returns `{job_id, status, stream_url}`
//! - POST   /case-study/generate/stream  - Create a job and stream its content deltas
//! - GET    /case-study/                 - List jobs (`limit`, `offset`)
//! - GET    /case-study/{id}             - Job snapshot
//! - GET    /case-study/{id}/stream      - Resumable progress stream
//! - POST   /case-study/{id}/cancel      - Cancel
//! - DELETE /case-study/{id}             - Delete a settled job

use futures::stream::{self, StreamExt};
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use super::auth_routes::require_session;
use super::response::{
    error_response, no_content, parse_json_body, parse_query, respond, sse_response, BoxBody,
};
use crate::identity::Session;
use crate::jobs::GenerationRequest;
use crate::server::AppState;
use crate::stream::sse::{data_frame, named_frame, retry_frame, RETRY_MS};
use crate::stream::sse_body;
use crate::types::CasebookError;

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

fn parse_job_id(segment: &str) -> Result<Uuid, CasebookError> {
    segment
        .parse()
        .map_err(|_| CasebookError::NotFound(format!("case study {} not found", segment)))
}

// =============================================================================
// Route Handlers
// =============================================================================

/// POST /case-study/generate
async fn handle_generate(
    req: Request<hyper::body::Incoming>,
    session: Result<Session, CasebookError>,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    let result = async {
        let session = session?;
        let request: GenerationRequest = parse_json_body(req).await?;
        Ok::<_, CasebookError>(state.jobs.create(session.user.id, request).await?)
    }
    .await;
    respond(StatusCode::OK, result)
}

/// POST /case-study/generate/stream
async fn handle_generate_stream(
    req: Request<hyper::body::Incoming>,
    session: Result<Session, CasebookError>,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    let result = async {
        let session = session?;
        let request: GenerationRequest = parse_json_body(req).await?;
        Ok::<_, CasebookError>(state.jobs.create_streaming(session.user.id, request).await?)
    }
    .await;

    match result {
        Ok((handle, subscription)) => {
            let frames = subscription
                .into_stream()
                .map(|event| data_frame(&serde_json::to_string(&event).unwrap_or_default()))
                .boxed();
            sse_response(
                sse_body(frames, state.args.keepalive_interval()),
                handle.job_id,
            )
        }
        Err(err) => error_response(err),
    }
}

/// GET /case-study/{id}/stream
async fn handle_progress_stream(
    session: Result<Session, CasebookError>,
    state: &AppState,
    job_id: Uuid,
) -> Response<BoxBody> {
    let result = async {
        let session = session?;
        Ok::<_, CasebookError>(state.jobs.subscribe_progress(session.user.id, job_id).await?)
    }
    .await;

    match result {
        Ok(subscription) => {
            let events = subscription.into_stream().map(|event| {
                let snapshot = event.snapshot();
                let data = serde_json::to_string(snapshot).unwrap_or_default();
                named_frame(event.name(), snapshot.sequence, &data)
            });
            let frames = stream::once(async { retry_frame(RETRY_MS) })
                .chain(events)
                .boxed();
            sse_response(sse_body(frames, state.args.keepalive_interval()), job_id)
        }
        Err(err) => error_response(err),
    }
}

/// GET /case-study/
async fn handle_list(
    session: Result<Session, CasebookError>,
    query: Result<ListQuery, CasebookError>,
    state: &AppState,
) -> Response<BoxBody> {
    let result = async {
        let session = session?;
        let query = query?;
        Ok::<_, CasebookError>(
            state
                .jobs
                .list(session.user.id, query.limit, query.offset)
                .await?,
        )
    }
    .await;
    respond(StatusCode::OK, result)
}

/// GET /case-study/{id}
async fn handle_get(
    session: Result<Session, CasebookError>,
    state: &AppState,
    job_id: Uuid,
) -> Response<BoxBody> {
    let result = async {
        let session = session?;
        Ok::<_, CasebookError>(state.jobs.get(session.user.id, job_id).await?)
    }
    .await;
    respond(StatusCode::OK, result)
}

/// POST /case-study/{id}/cancel
async fn handle_cancel(
    session: Result<Session, CasebookError>,
    state: &AppState,
    job_id: Uuid,
) -> Response<BoxBody> {
    let result = async {
        let session = session?;
        Ok::<_, CasebookError>(state.jobs.cancel(session.user.id, job_id).await?)
    }
    .await;
    respond(StatusCode::OK, result)
}

/// DELETE /case-study/{id}
async fn handle_delete(
    session: Result<Session, CasebookError>,
    state: &AppState,
    job_id: Uuid,
) -> Response<BoxBody> {
    let result = async {
        let session = session?;
        state.jobs.delete(session.user.id, job_id).await?;
        Ok::<_, CasebookError>(())
    }
    .await;
    match result {
        Ok(()) => no_content(),
        Err(err) => error_response(err),
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Handle `/case-study*`. Returns `None` for paths outside this prefix.
pub async fn handle_case_study_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Option<Response<BoxBody>> {
    let path = req.uri().path().to_string();
    let rest = path.strip_prefix("/case-study")?;
    if !(rest.is_empty() || rest.starts_with('/')) {
        return None;
    }
    let rest = rest.trim_matches('/');
    let method = req.method().clone();
    let session = require_session(&req, &state);

    let response = match (&method, rest) {
        (&Method::POST, "generate") => handle_generate(req, session, state).await,
        (&Method::POST, "generate/stream") => handle_generate_stream(req, session, state).await,
        (&Method::GET, "") => {
            let query = parse_query(&req);
            handle_list(session, query, &state).await
        }
        _ => {
            let (segment, action) = rest.split_once('/').unwrap_or((rest, ""));
            let job_id = match parse_job_id(segment) {
                Ok(job_id) => job_id,
                Err(err) => return Some(error_response(err)),
            };
            match (&method, action) {
                (&Method::GET, "") => handle_get(session, &state, job_id).await,
                (&Method::DELETE, "") => handle_delete(session, &state, job_id).await,
                (&Method::GET, "stream") => handle_progress_stream(session, &state, job_id).await,
                (&Method::POST, "cancel") => handle_cancel(session, &state, job_id).await,
                _ => return None,
            }
        }
    };

    Some(response)
}
