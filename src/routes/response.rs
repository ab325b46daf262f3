//! Response and request helpers shared by the route handlers

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, warn};
use uuid::Uuid;

use crate::types::CasebookError;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

const MAX_BODY_BYTES: usize = 64 * 1024;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Set a header, skipping values that are not valid header text
pub fn set_header(response: &mut Response<BoxBody>, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            response.headers_mut().insert(name, value);
        }
        Err(_) => warn!(header = %name, "Dropping invalid header value"),
    }
}

pub fn append_header(response: &mut Response<BoxBody>, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response.headers_mut().append(name, value);
    }
}

fn with_status(status: StatusCode, body: BoxBody) -> Response<BoxBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<BoxBody> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let mut response = with_status(status, full_body(json));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

pub fn error_response(err: CasebookError) -> Response<BoxBody> {
    let status = err.status_code();
    if status.is_server_error() {
        error!(status = status.as_u16(), error = %err, "Request failed");
    }
    let (status, body) = err.into_status_code_and_body();
    let mut response = with_status(status, full_body(body));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Unwrap a handler result into a response
pub fn respond<T: Serialize>(status: StatusCode, result: Result<T, CasebookError>) -> Response<BoxBody> {
    match result {
        Ok(body) => json_response(status, &body),
        Err(err) => error_response(err),
    }
}

pub fn no_content() -> Response<BoxBody> {
    with_status(StatusCode::NO_CONTENT, empty_body())
}

pub fn redirect_response(location: &str) -> Response<BoxBody> {
    let mut response = with_status(StatusCode::FOUND, empty_body());
    set_header(&mut response, header::LOCATION, location);
    response
}

pub fn not_found_response(path: &str) -> Response<BoxBody> {
    error_response(CasebookError::NotFound(format!("no route for {}", path)))
}

/// Event-stream response around an SSE body
pub fn sse_response(body: BoxBody, job_id: Uuid) -> Response<BoxBody> {
    let mut response = with_status(StatusCode::OK, body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    set_header(
        &mut response,
        HeaderName::from_static("x-job-id"),
        &job_id.to_string(),
    );
    response
}

/// Read and decode a JSON request body
pub async fn parse_json_body<T: DeserializeOwned>(
    req: Request<hyper::body::Incoming>,
) -> Result<T, CasebookError> {
    let body = req
        .collect()
        .await
        .map_err(|e| CasebookError::BadRequest(format!("Failed to read body: {}", e)))?;

    let bytes = body.to_bytes();
    if bytes.len() > MAX_BODY_BYTES {
        return Err(CasebookError::BadRequest("Request body too large".into()));
    }

    serde_json::from_slice(&bytes)
        .map_err(|e| CasebookError::BadRequest(format!("Invalid JSON: {}", e)))
}

/// Decode the query string, empty when absent
pub fn parse_query<T: DeserializeOwned, B>(req: &Request<B>) -> Result<T, CasebookError> {
    serde_urlencoded::from_str(req.uri().query().unwrap_or(""))
        .map_err(|e| CasebookError::BadRequest(format!("Invalid query: {}", e)))
}

pub fn cookie_header<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
}
