//! Stripstore Common - Shared types and utilities
//!
//! This crate provides common types, error definitions, and configuration
//! used across all stripstore components.

pub mod config;
pub mod error;
pub mod types;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use types::*;
