//! HTTP Routes for identity and data-source connections
//!
//! - GET    /auth/login                           - Redirect to the identity provider
//! - GET    /auth/callback                        - Finish login, set the session cookie
//! - GET    /auth/me                              - Current user
//! - POST   /auth/logout                          - End the session
//! - GET    /auth/connections/status              - Per-service and aggregate health
//! - POST   /auth/connections/{service}/grant     - Start consent for a service
//! - GET    /auth/connections/{service}/callback  - Finish consent
//! - POST   /auth/connections/{service}/refresh   - Rotate the service credential
//! - DELETE /auth/connections/{service}           - Revoke
//!
//! Every route except login and its callback needs the session cookie.

use hyper::header::SET_COOKIE;
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::response::{
    append_header, cookie_header, error_response, json_response, parse_query, redirect_response,
    respond, BoxBody,
};
use crate::connections::{ProviderCallback, ServiceName};
use crate::identity::Session;
use crate::server::AppState;
use crate::types::CasebookError;

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
}

#[derive(Debug, Serialize)]
struct RevokeResponse {
    service: ServiceName,
    status: &'static str,
}

/// Resolve the caller's session from the cookie
pub fn require_session<B>(req: &Request<B>, state: &AppState) -> Result<Session, CasebookError> {
    state.identity.authenticate(cookie_header(req))
}

fn frontend_redirect(state: &AppState, key: &str, value: &str) -> String {
    let query = serde_urlencoded::to_string([(key, value)]).unwrap_or_default();
    format!("{}/?{}", state.args.frontend_url.trim_end_matches('/'), query)
}

fn parse_service(segment: &str) -> Result<ServiceName, CasebookError> {
    segment.parse().map_err(CasebookError::NotFound)
}

// =============================================================================
// Route Handlers
// =============================================================================

/// GET /auth/login
fn handle_login(state: &AppState) -> Response<BoxBody> {
    redirect_response(&state.identity.begin_login())
}

/// GET /auth/callback
async fn handle_login_callback(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    let callback: ProviderCallback = match parse_query(&req) {
        Ok(callback) => callback,
        Err(err) => return error_response(err),
    };

    match state.identity.complete_login(callback).await {
        Ok((_, token)) => {
            let mut response = redirect_response(&frontend_redirect(&state, "login", "ok"));
            let cookie = state.identity.sessions().session_cookie(&token);
            append_header(&mut response, SET_COOKIE, &cookie);
            response
        }
        Err(err) => {
            warn!(error = %err, "Login callback rejected");
            redirect_response(&frontend_redirect(&state, "login_error", err.code()))
        }
    }
}

/// GET /auth/me
fn handle_me(session: Result<Session, CasebookError>) -> Response<BoxBody> {
    respond(StatusCode::OK, session.map(|session| session.user))
}

/// POST /auth/logout
fn handle_logout(req: &Request<hyper::body::Incoming>, state: &AppState) -> Response<BoxBody> {
    state.identity.logout(cookie_header(req));
    let mut response = json_response(StatusCode::OK, &SuccessResponse { success: true });
    let cookie = state.identity.sessions().clear_cookie();
    append_header(&mut response, SET_COOKIE, &cookie);
    response
}

/// GET /auth/connections/status
async fn handle_connection_status(
    session: Result<Session, CasebookError>,
    state: &AppState,
) -> Response<BoxBody> {
    match session {
        Ok(session) => {
            let report = state.connections.health(session.user.id).await;
            json_response(StatusCode::OK, &report)
        }
        Err(err) => error_response(err),
    }
}

/// POST /auth/connections/{service}/grant
async fn handle_grant(
    session: Result<Session, CasebookError>,
    state: &AppState,
    service: ServiceName,
) -> Response<BoxBody> {
    let result = async {
        let session = session?;
        Ok::<_, CasebookError>(state.connections.grant(session.user.id, service).await?)
    }
    .await;
    respond(StatusCode::OK, result)
}

/// GET /auth/connections/{service}/callback
async fn handle_grant_callback(
    session: Result<Session, CasebookError>,
    callback: Result<ProviderCallback, CasebookError>,
    state: &AppState,
    service: ServiceName,
) -> Response<BoxBody> {
    let (session, callback) = match (session, callback) {
        (Ok(session), Ok(callback)) => (session, callback),
        (Err(err), _) | (_, Err(err)) => return error_response(err),
    };

    match state
        .connections
        .complete_grant(session.user.id, service, callback)
        .await
    {
        Ok(_) => redirect_response(&frontend_redirect(state, "connected", service.as_str())),
        Err(_) => redirect_response(&frontend_redirect(
            state,
            "connection_error",
            service.as_str(),
        )),
    }
}

/// POST /auth/connections/{service}/refresh
async fn handle_refresh(
    session: Result<Session, CasebookError>,
    state: &AppState,
    service: ServiceName,
) -> Response<BoxBody> {
    let result = async {
        let session = session?;
        Ok::<_, CasebookError>(state.connections.refresh(session.user.id, service).await?)
    }
    .await;
    respond(StatusCode::OK, result)
}

/// DELETE /auth/connections/{service}
async fn handle_revoke(
    session: Result<Session, CasebookError>,
    state: &AppState,
    service: ServiceName,
) -> Response<BoxBody> {
    let result = async {
        let session = session?;
        state.connections.revoke(session.user.id, service).await?;
        info!(user_id = %session.user.id, service = %service, "Connection revoked by user");
        Ok::<_, CasebookError>(RevokeResponse {
            service,
            status: "disconnected",
        })
    }
    .await;
    respond(StatusCode::OK, result)
}

// =============================================================================
// Dispatch
// =============================================================================

/// Handle `/auth/*`. Returns `None` for paths outside this prefix.
pub async fn handle_auth_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> Option<Response<BoxBody>> {
    let path = req.uri().path().to_string();
    if !path.starts_with("/auth/") {
        return None;
    }
    let method = req.method().clone();

    let session = require_session(&req, &state);

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/auth/login") => handle_login(&state),
        (&Method::GET, "/auth/callback") => handle_login_callback(req, state).await,
        (&Method::GET, "/auth/me") => handle_me(session),
        (&Method::POST, "/auth/logout") => handle_logout(&req, &state),
        (&Method::GET, "/auth/connections/status") => {
            handle_connection_status(session, &state).await
        }
        (_, p) if p.starts_with("/auth/connections/") => {
            let rest = &p["/auth/connections/".len()..];
            let (segment, action) = rest.split_once('/').unwrap_or((rest, ""));
            let service = match parse_service(segment) {
                Ok(service) => service,
                Err(err) => return Some(error_response(err)),
            };
            match (&method, action) {
                (&Method::POST, "grant") => handle_grant(session, &state, service).await,
                (&Method::GET, "callback") => {
                    let callback = parse_query(&req);
                    handle_grant_callback(session, callback, &state, service).await
                }
                (&Method::POST, "refresh") => handle_refresh(session, &state, service).await,
                (&Method::DELETE, "") => handle_revoke(session, &state, service).await,
                _ => return None,
            }
        }
        _ => return None,
    };

    Some(response)
}
