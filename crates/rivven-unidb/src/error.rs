//! Error types for rivven-unidb
//!
//! Errors raised by this layer (registry, dispatcher, request validation) carry
//! their own variants. Failures coming out of a database driver are surfaced as
//! [`Error::Driver`] whose `Display` output is the driver message verbatim, so
//! callers see exactly what the backend reported.

use std::fmt;
use thiserror::Error;

use crate::backend::BackendKind;

/// Result type for rivven-unidb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Backend kind not recognised or not compiled in
    Backend,
    /// Registry is full
    Capacity,
    /// Handshake with the backend failed
    Connection,
    /// Unknown connection id
    NotFound,
    /// Request rejected before reaching the backend
    Request,
    /// Failure reported by the backend driver
    Driver,
    /// Configuration error
    Configuration,
    /// Unknown/other errors
    Other,
}

/// Main error type for rivven-unidb
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Backend kind is not one of the supported kinds, or no adapter is registered for it
    #[error("unsupported backend: {backend}")]
    UnsupportedBackend { backend: String },

    /// Connection registry is at its configured maximum
    #[error("connection limit reached ({max} connections)")]
    CapacityExceeded { max: usize },

    /// Backend handshake failed; `cause` is the driver message unmodified
    #[error("failed to connect to {backend_kind}: {cause}")]
    ConnectionError {
        backend_kind: BackendKind,
        cause: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// No live connection with this id
    #[error("connection not found: {id}")]
    ConnectionNotFound { id: String },

    /// Caller supplied an id that is already registered
    #[error("connection id already in use: {id}")]
    DuplicateConnectionId { id: String },

    /// Structured request is missing required fields or has the wrong shape
    #[error("malformed request: {message}")]
    MalformedRequest { message: String },

    /// Structured request names an operation outside the supported set
    #[error("unsupported operation: {operation}")]
    UnsupportedOperation { operation: String },

    /// Failure reported by the underlying driver, passed through unchanged
    #[error("{message}")]
    Driver {
        backend_kind: BackendKind,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Feature not available for this backend
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnsupportedBackend { .. } => ErrorCategory::Backend,
            Self::CapacityExceeded { .. } => ErrorCategory::Capacity,
            Self::ConnectionError { .. } => ErrorCategory::Connection,
            Self::ConnectionNotFound { .. } => ErrorCategory::NotFound,
            Self::DuplicateConnectionId { .. }
            | Self::MalformedRequest { .. }
            | Self::UnsupportedOperation { .. } => ErrorCategory::Request,
            Self::Driver { .. } => ErrorCategory::Driver,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Unsupported { .. } | Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Create an unsupported backend error
    pub fn unsupported_backend(backend: impl Into<String>) -> Self {
        Self::UnsupportedBackend {
            backend: backend.into(),
        }
    }

    /// Create a handshake error from a driver error, keeping its message as the cause
    pub fn connection(
        backend_kind: BackendKind,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ConnectionError {
            backend_kind,
            cause: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a handshake error from a plain message
    pub fn connection_message(backend_kind: BackendKind, cause: impl Into<String>) -> Self {
        Self::ConnectionError {
            backend_kind,
            cause: cause.into(),
            source: None,
        }
    }

    /// Create a connection-not-found error
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::ConnectionNotFound { id: id.into() }
    }

    /// Create a malformed request error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRequest {
            message: message.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported_operation(operation: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            operation: operation.into(),
        }
    }

    /// Wrap a driver error without altering its message
    pub fn driver(
        backend_kind: BackendKind,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Driver {
            backend_kind,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a driver error from a plain message
    pub fn driver_message(backend_kind: BackendKind, message: impl Into<String>) -> Self {
        Self::Driver {
            backend_kind,
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an unsupported feature error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend => write!(f, "backend"),
            Self::Capacity => write!(f, "capacity"),
            Self::Connection => write!(f, "connection"),
            Self::NotFound => write!(f, "not_found"),
            Self::Request => write!(f, "request"),
            Self::Driver => write!(f, "driver"),
            Self::Configuration => write!(f, "configuration"),
            Self::Other => write!(f, "other"),
        }
    }
}
