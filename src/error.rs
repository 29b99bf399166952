//! Error types
//!
//! Every error carries an [`ErrorCategory`]. The connection handle uses the
//! category to decide what happens to the connection it holds when a scope
//! fails: interface failures discard it, operation failures roll it back.

use std::io;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Server closed the connection
    #[error("connection closed by server")]
    ConnectionClosed,

    /// Protocol violation (desync, malformed message)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The session is unusable (reported by the driver)
    #[error("interface error: {0}")]
    Interface(String),

    /// Statement rejected by the server
    #[error("SQL error: {message}{}", code.as_ref().map(|c| format!(" ({})", c)).unwrap_or_default())]
    Sql {
        /// SQLSTATE code, if the server sent one
        code: Option<String>,
        /// Server message
        message: String,
    },

    /// Any other failure raised while a connection is in use
    #[error("operation failed: {0}")]
    Operation(String),

    /// Invalid state transition
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Capability not provided by the driver
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Could not establish or acquire a connection
    #[error("connection error: {message}")]
    Connection {
        /// What went wrong
        message: String,
        /// Underlying cause
        #[source]
        source: Option<Box<Error>>,
    },

    /// commit/rollback called while the handle holds no connection
    #[error("no active connection on handle '{handle}'")]
    NoActiveConnection {
        /// Handle name
        handle: String,
    },

    /// Authentication failed
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Coarse error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transport or session is unusable
    Interface,
    /// Statement-level failure; the connection is still usable
    Operation,
    /// Capability invoked without a concrete implementation
    NotImplemented,
    /// Failure to acquire or establish a connection
    Connection,
}

impl Error {
    /// Build a connection error without an underlying cause
    pub fn connection(message: impl Into<String>) -> Self {
        Error::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap `cause` as a connection error, keeping it as the source
    pub fn connection_caused_by(message: impl Into<String>, cause: Error) -> Self {
        Error::Connection {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    /// Category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Io(_) | Error::ConnectionClosed | Error::Protocol(_) | Error::Interface(_) => {
                ErrorCategory::Interface
            }
            Error::Sql { .. } | Error::Operation(_) | Error::InvalidState { .. } => {
                ErrorCategory::Operation
            }
            Error::NotImplemented(_) => ErrorCategory::NotImplemented,
            Error::Connection { .. }
            | Error::NoActiveConnection { .. }
            | Error::Authentication(_)
            | Error::Config(_) => ErrorCategory::Connection,
        }
    }

    /// Whether the session behind this error is dead
    pub fn is_interface(&self) -> bool {
        self.category() == ErrorCategory::Interface
    }

    /// Whether this error means no connection could be obtained
    pub fn is_connection_error(&self) -> bool {
        self.category() == ErrorCategory::Connection
    }

    /// SQLSTATE code, for server-reported errors
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Sql { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Short label used for metrics
    pub fn category_label(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Interface => "interface",
            ErrorCategory::Operation => "operation",
            ErrorCategory::NotImplemented => "not_implemented",
            ErrorCategory::Connection => "connection",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_categories() {
        assert!(Error::ConnectionClosed.is_interface());
        assert!(Error::Protocol("desync".into()).is_interface());
        assert!(Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe")).is_interface());
        assert_eq!(
            Error::Operation("boom".into()).category(),
            ErrorCategory::Operation
        );
        assert_eq!(
            Error::NotImplemented("execute".into()).category(),
            ErrorCategory::NotImplemented
        );
        assert!(Error::connection("pool exhausted").is_connection_error());
        assert!(Error::NoActiveConnection {
            handle: "primary".into()
        }
        .is_connection_error());
    }

    #[test]
    fn test_sql_display_includes_code() {
        let err = Error::Sql {
            code: Some("23505".into()),
            message: "duplicate key".into(),
        };
        assert_eq!(err.to_string(), "SQL error: duplicate key (23505)");
        assert_eq!(err.sqlstate(), Some("23505"));

        let err = Error::Sql {
            code: None,
            message: "oops".into(),
        };
        assert_eq!(err.to_string(), "SQL error: oops");
    }

    #[test]
    fn test_connection_error_keeps_source() {
        let err = Error::connection_caused_by("connect to primary", Error::ConnectionClosed);
        let source = err.source().expect("source");
        assert_eq!(source.to_string(), "connection closed by server");
        assert_eq!(err.category_label(), "connection");
    }
}
