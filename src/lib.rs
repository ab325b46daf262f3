//! Casebook - case study generation service
//!
//! Casebook turns a user's connected data sources into a structured case
//! study. Generation runs as a background job; its output is delivered live
//! over server-sent events.
//!
//! ## Components
//!
//! - **Connections**: per-user OAuth grants for data-source services, with
//!   single-flight credential refresh and health reporting
//! - **Jobs**: section-by-section generation through a content engine
//! - **Sources**: scope searches against the connected Gmail and Drive accounts
//! - **Stream**: the content-delta stream and the resumable progress stream
//! - **Client**: a sync store that reconciles cached identity and job state
//!   with the server

pub mod client;
pub mod config;
pub mod connections;
pub mod crypto;
pub mod identity;
pub mod jobs;
pub mod routes;
pub mod server;
pub mod sources;
pub mod stream;
pub mod types;

pub use config::Args;
pub use server::{run, serve, AppState};
pub use types::{CasebookError, Result};
