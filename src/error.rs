/// Unified error handling for the espejo proxy
///
/// This module provides the error types shared by the engine, the backend
/// driver seam and the client front-end. Mirror failures are represented here
/// too, but they never leave the fan-out path.
use std::fmt;
use std::io;
use thiserror::Error;

pub use crate::config::ConfigError;

/// Main error type for espejo operations
#[derive(Debug, Error)]
pub enum EspejoError {
    /// Network-related errors, including client-facing writer failures
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Client protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Errors reported by a backend connection
    #[error("Backend {backend} error: {source}")]
    Backend {
        backend: String,
        #[source]
        source: BackendError,
    },

    /// Startup sequencing errors (fatal)
    #[error("Startup failed: {message}")]
    Startup { message: String },

    /// A client request the proxy refuses, reported with its own SQLSTATE
    #[error("{message}")]
    Rejected { code: &'static str, message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Errors produced by the backend driver
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("connection failed: {0}")]
    Connect(String),

    /// The backend rejected a query. `code` is the SQLSTATE when the server sent one.
    #[error("{message}")]
    Query {
        code: Option<String>,
        message: String,
    },

    #[error("connection is closed")]
    Closed,

    #[error("could not decode value: {0}")]
    Decode(String),
}

/// Result type alias for espejo operations
pub type EspejoResult<T> = Result<T, EspejoError>;

/// Convenience methods for creating specific error types
impl EspejoError {
    /// Create a backend error tagged with the backend identity
    pub fn backend<S: Into<String>>(backend: S, source: BackendError) -> Self {
        EspejoError::Backend {
            backend: backend.into(),
            source,
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        EspejoError::Protocol(message.into())
    }

    /// Create a startup error
    pub fn startup<S: Into<String>>(message: S) -> Self {
        EspejoError::Startup {
            message: message.into(),
        }
    }

    /// Create a rejection of a client request
    pub fn rejected<S: Into<String>>(code: &'static str, message: S) -> Self {
        EspejoError::Rejected {
            code,
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        EspejoError::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        EspejoError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable (the client session may continue)
    pub fn is_recoverable(&self) -> bool {
        match self {
            EspejoError::Backend { source, .. } => {
                matches!(source, BackendError::Query { .. } | BackendError::Decode(_))
            }
            EspejoError::Rejected { .. } => true,
            EspejoError::Timeout { .. } => true,
            EspejoError::Protocol(_) => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            EspejoError::Config(_) => ErrorSeverity::Critical,
            EspejoError::Startup { .. } => ErrorSeverity::Critical,
            EspejoError::Internal { .. } => ErrorSeverity::Critical,
            EspejoError::Network(_) => ErrorSeverity::Warning,
            EspejoError::Timeout { .. } => ErrorSeverity::Warning,
            EspejoError::Rejected { .. } => ErrorSeverity::Info,
            EspejoError::Backend { source, .. } => match source {
                BackendError::Query { .. } => ErrorSeverity::Info,
                _ => ErrorSeverity::Error,
            },
            _ => ErrorSeverity::Error,
        }
    }

    /// SQLSTATE reported to the client when this error ends a query
    pub fn sqlstate(&self) -> &str {
        match self {
            EspejoError::Backend {
                source: BackendError::Query {
                    code: Some(code), ..
                },
                ..
            } => code,
            EspejoError::Backend {
                source: BackendError::Query { code: None, .. },
                ..
            } => "XX000",
            EspejoError::Backend {
                source: BackendError::Decode(_),
                ..
            } => "22P03",
            EspejoError::Backend { .. } => "08006",
            EspejoError::Rejected { code, .. } => code,
            EspejoError::Network(_) => "08006",
            EspejoError::Protocol(_) => "08P01",
            EspejoError::Timeout { .. } => "57014",
            _ => "XX000",
        }
    }

    /// Message shown to the client. Backend query errors are relayed verbatim.
    pub fn client_message(&self) -> String {
        match self {
            EspejoError::Backend {
                source: BackendError::Query { message, .. },
                ..
            } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl BackendError {
    /// Create a query error without a SQLSTATE
    pub fn query<S: Into<String>>(message: S) -> Self {
        BackendError::Query {
            code: None,
            message: message.into(),
        }
    }
}

impl From<tokio_postgres::Error> for BackendError {
    fn from(e: tokio_postgres::Error) -> Self {
        if let Some(db) = e.as_db_error() {
            return BackendError::Query {
                code: Some(db.code().code().to_string()),
                message: db.message().to_string(),
            };
        }
        if e.is_closed() {
            return BackendError::Closed;
        }
        BackendError::query(e.to_string())
    }
}

/// Error severity levels for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that stop the process
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}
