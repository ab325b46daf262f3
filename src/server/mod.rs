//! HTTP server for Casebook

pub mod http;

pub use http::{run, serve, AppState};
