//! Error types for zero-gauss.

use std::sync::Arc;

use thiserror::Error;

/// Result type for zero-gauss operations.
pub type Result<T> = core::result::Result<T, Error>;

/// SQLSTATE codes that stop the connection manager from trying further candidates.
pub mod sqlstate {
    /// invalid_authorization_specification (unknown role, pg_hba rejection)
    pub const INVALID_AUTHORIZATION_SPECIFICATION: &str = "28000";
    /// invalid_password
    pub const INVALID_PASSWORD: &str = "28P01";
    /// invalid_catalog_name (database does not exist)
    pub const INVALID_CATALOG_NAME: &str = "3D000";
    /// insufficient_privilege (missing CONNECT privilege)
    pub const INSUFFICIENT_PRIVILEGE: &str = "42501";
    /// query_canceled
    pub const QUERY_CANCELED: &str = "57014";
}

/// Error/notice fields reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    /// Severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
    pub severity: Option<String>,
    /// Non-localized severity (same as severity but never translated)
    pub severity_non_localized: Option<String>,
    /// SQLSTATE error code (5 characters)
    pub code: Option<String>,
    /// Primary error message
    pub message: Option<String>,
    /// Detailed error explanation
    pub detail: Option<String>,
    /// Suggestion for fixing the error
    pub hint: Option<String>,
    /// Cursor position in query string (1-based)
    pub position: Option<u32>,
    /// Position in internal query
    pub internal_position: Option<u32>,
    /// Failed internal command text
    pub internal_query: Option<String>,
    /// Context/stack trace
    pub where_: Option<String>,
    /// Schema name
    pub schema: Option<String>,
    /// Table name
    pub table: Option<String>,
    /// Column name
    pub column: Option<String>,
    /// Data type name
    pub data_type: Option<String>,
    /// Constraint name
    pub constraint: Option<String>,
    /// Source file name
    pub file: Option<String>,
    /// Source line number
    pub line: Option<u32>,
    /// Source routine name
    pub routine: Option<String>,
}

impl ErrorFields {
    /// Severity, preferring the non-localized form.
    pub fn severity(&self) -> Option<&str> {
        self.severity_non_localized
            .as_deref()
            .or(self.severity.as_deref())
    }

    /// Whether the server will close the session after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity(), Some("FATAL") | Some("PANIC"))
    }
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(severity) = &self.severity {
            write!(f, "{}: ", severity)?;
        }
        if let Some(message) = &self.message {
            write!(f, "{}", message)?;
        }
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {})", code)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {}", hint)?;
        }
        Ok(())
    }
}

/// Error type for zero-gauss.
#[derive(Debug, Error)]
pub enum Error {
    /// Server error response
    #[error("server error: {0}")]
    Server(ErrorFields),

    /// Protocol error (malformed message, unexpected response, etc.)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    Auth(String),

    /// TLS error
    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// The server answered an SSLRequest with 'N'
    #[error("server refused TLS")]
    TlsRefused,

    /// Connection string could not be parsed
    #[error("cannot parse `{input}`: {cause}")]
    Config {
        /// The offending input (passwords are redacted)
        input: String,
        /// What was wrong with it
        cause: String,
    },

    /// Every connection candidate failed; carries the last cause
    #[error("failed to connect to `host={host} port={port}`: {source}")]
    Connect {
        /// Host of the last candidate tried
        host: String,
        /// Port of the last candidate tried
        port: u16,
        /// Last failure
        source: Box<Error>,
    },

    /// Connection is broken and cannot be reused
    #[error("connection is broken")]
    ConnectionBroken,

    /// Invalid usage (e.g., nested transactions)
    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    /// Unsupported feature
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Value decoding failed
    #[error("decode error: {0}")]
    Decode(String),

    /// Value encoding failed
    #[error("encode error: {0}")]
    Encode(String),

    /// Connect timeout elapsed
    #[error("timeout expired")]
    Timeout,

    /// The operation was cancelled before it could start
    #[error("operation cancelled")]
    Cancelled,

    /// A COPY session already observed this error
    #[error("copy failed: {0}")]
    Copy(Arc<Error>),
}

impl Error {
    /// Returns true if the error indicates the connection is broken and cannot be reused.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::Io(_) | Error::Protocol(_) | Error::ConnectionBroken => true,
            Error::Server(fields) => fields.is_fatal(),
            Error::Copy(inner) => inner.is_connection_broken(),
            _ => false,
        }
    }

    /// Get the SQLSTATE code if this is a server error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(fields) => fields.code.as_deref(),
            Error::Copy(inner) => inner.sqlstate(),
            Error::Connect { source, .. } => source.sqlstate(),
            _ => None,
        }
    }

    /// Returns true for server errors that make trying other hosts pointless
    /// (wrong password, unknown role or database, no CONNECT privilege).
    pub fn aborts_fallback(&self) -> bool {
        matches!(
            self.sqlstate(),
            Some(sqlstate::INVALID_PASSWORD)
                | Some(sqlstate::INVALID_AUTHORIZATION_SPECIFICATION)
                | Some(sqlstate::INVALID_CATALOG_NAME)
                | Some(sqlstate::INSUFFICIENT_PRIVILEGE)
        )
    }

    pub(crate) fn config(input: &str, cause: impl Into<String>) -> Self {
        Error::Config {
            input: input.to_string(),
            cause: cause.into(),
        }
    }

    pub(crate) fn type_mismatch(value_oid: u32, target_oid: u32) -> Self {
        Error::Encode(format!(
            "cannot encode value of oid {} as oid {}",
            value_oid, target_oid
        ))
    }
}

impl From<core::convert::Infallible> for Error {
    fn from(never: core::convert::Infallible) -> Self {
        match never {}
    }
}

impl<Src: std::fmt::Debug, Dst: std::fmt::Debug + ?Sized>
    From<zerocopy::error::CastError<Src, Dst>> for Error
{
    fn from(err: zerocopy::error::CastError<Src, Dst>) -> Self {
        Error::Protocol(format!("zerocopy cast error: {err:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(code: &str, severity: &str) -> Error {
        Error::Server(ErrorFields {
            severity: Some(severity.into()),
            code: Some(code.into()),
            message: Some("boom".into()),
            ..Default::default()
        })
    }

    #[test]
    fn test_fatal_server_error_breaks_connection() {
        assert!(server_error("57P01", "FATAL").is_connection_broken());
        assert!(!server_error("42P01", "ERROR").is_connection_broken());
        assert!(Error::Protocol("x".into()).is_connection_broken());
    }

    #[test]
    fn test_aborts_fallback() {
        assert!(server_error("28P01", "FATAL").aborts_fallback());
        assert!(server_error("3D000", "FATAL").aborts_fallback());
        assert!(server_error("28000", "FATAL").aborts_fallback());
        assert!(!server_error("53300", "FATAL").aborts_fallback());
        assert!(!Error::TlsRefused.aborts_fallback());
    }

    #[test]
    fn test_sqlstate_through_copy_error() {
        let err = Error::Copy(Arc::new(server_error("23505", "ERROR")));
        assert_eq!(err.sqlstate(), Some("23505"));
    }

    #[test]
    fn test_display() {
        let err = server_error("42P01", "ERROR");
        assert_eq!(err.to_string(), "server error: ERROR: boom (SQLSTATE 42P01)");
    }
}
