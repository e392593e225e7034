//! Shared types, error definitions, and utilities used across all moltis crates.

pub mod error;
pub mod types;

pub use error::{Error, FromMessage, MoltisError, Result};
