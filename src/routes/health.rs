//! Operational endpoints
//!
//! - /health  - liveness plus a count of jobs still generating
//! - /version - build information from `build.rs`

use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::response::{json_response, BoxBody};
use crate::server::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub active_jobs: usize,
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: &'static str,
    /// Git commit hash (short)
    pub git_commit: &'static str,
    pub git_commit_full: &'static str,
    pub build_time: &'static str,
    pub service: &'static str,
}

pub fn health_check(state: &AppState) -> Response<BoxBody> {
    let response = HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_jobs: state.jobs.active_jobs(),
    };
    json_response(StatusCode::OK, &response)
}

/// Returns build information for deployment verification.
pub fn version_info() -> Response<BoxBody> {
    let response = VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        git_commit: option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
        git_commit_full: option_env!("GIT_COMMIT_FULL").unwrap_or("unknown"),
        build_time: option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
        service: "casebook",
    };
    json_response(StatusCode::OK, &response)
}
