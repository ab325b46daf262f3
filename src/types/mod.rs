//! Shared types for Casebook

pub mod error;

pub use error::{CasebookError, ErrorBody, Result};
