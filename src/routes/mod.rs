//! HTTP routes for Casebook

pub mod auth_routes;
pub mod case_study;
pub mod data;
pub mod health;
pub mod response;

pub use auth_routes::{handle_auth_request, require_session};
pub use case_study::handle_case_study_request;
pub use data::handle_data_request;
pub use health::{health_check, version_info, HealthResponse};
pub use response::BoxBody;
