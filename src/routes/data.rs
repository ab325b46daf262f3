//! HTTP Routes for data sources
//!
//! - POST /data/preview - Search every connected source for a scope, per-service counts

use hyper::{Method, Request, Response, StatusCode};
use std::sync::Arc;

use super::auth_routes::require_session;
use super::response::{parse_json_body, respond, BoxBody};
use crate::jobs::GenerationRequest;
use crate::server::AppState;
use crate::types::CasebookError;

/// POST /data/preview
async fn handle_preview(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    let session = require_session(&req, &state);
    let result = async {
        let session = session?;
        let request: GenerationRequest = parse_json_body(req).await?;
        Ok::<_, CasebookError>(state.jobs.preview(session.user.id, request).await?)
    }
    .await;
    respond(StatusCode::OK, result)
}

/// Handle `/data/*`. Returns `None` for unknown paths.
pub async fn handle_data_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Option<Response<BoxBody>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    match (&method, path.trim_end_matches('/')) {
        (&Method::POST, "/data/preview") => Some(handle_preview(req, state).await),
        _ => None,
    }
}
