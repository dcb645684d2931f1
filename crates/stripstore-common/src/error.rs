//! Error types for stripstore
//!
//! This module defines the common error types used throughout the store.

use thiserror::Error;

/// Common result type for stripstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for stripstore
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("collection not empty: {0}")]
    NotEmpty(String),

    #[error("no data: {0}")]
    NoData(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no space left on device")]
    NoSpace,

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an already exists error
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists(what.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a not empty error
    pub fn not_empty(what: impl Into<String>) -> Self {
        Self::NotEmpty(what.into())
    }

    /// Create a no data error
    pub fn no_data(what: impl Into<String>) -> Self {
        Self::NoData(what.into())
    }

    /// Create a busy error
    pub fn busy(msg: impl Into<String>) -> Self {
        Self::Busy(msg.into())
    }

    /// Create an unsupported error
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is a no data error
    #[must_use]
    pub fn is_no_data(&self) -> bool {
        matches!(self, Self::NoData(_))
    }

    /// Check if this is a no space error
    #[must_use]
    pub fn is_no_space(&self) -> bool {
        matches!(self, Self::NoSpace)
    }

    /// Check if this is an I/O error
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_predicates() {
        assert!(Error::not_found("object").is_not_found());
        assert!(Error::no_data("attr").is_no_data());
        assert!(Error::NoSpace.is_no_space());
        assert!(!Error::busy("fsid").is_not_found());
    }

    #[test]
    fn test_error_display() {
        let e = Error::not_found("coll/obj");
        assert_eq!(e.to_string(), "not found: coll/obj");
        let e = Error::unsupported("collection rename");
        assert_eq!(e.to_string(), "operation not supported: collection rename");
    }
}
