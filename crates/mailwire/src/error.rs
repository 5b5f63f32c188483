//! Error types for the transport engine.
//!
//! Errors fall into two classes: connection-fatal errors (I/O, TLS, timeouts,
//! parse and compile failures, compression failures) that tear the connection
//! down through a single funnel, and per-command server rejections ([`Error::No`],
//! [`Error::Bad`]) that surface only through the command's completion and leave
//! the connection usable.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while driving an IMAP connection.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS handshake or encryption error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// A socket write was not answered within its deadline.
    #[error("Socket timed out after {0:?}")]
    Timeout(Duration),

    /// Response parsing error.
    #[error("Parse error at position {position}: {message}")]
    Parse {
        /// Byte position where the error occurred.
        position: usize,
        /// Description of what went wrong.
        message: String,
    },

    /// Request serialization error.
    #[error("Compile error: {0}")]
    Compile(String),

    /// Server answered the current command with NO.
    #[error("Server returned NO: {message}")]
    No {
        /// Machine-readable response code, e.g. `AUTHENTICATIONFAILED`.
        code: Option<String>,
        /// Human-readable text from the response.
        message: String,
    },

    /// Server answered the current command with BAD.
    #[error("Server returned BAD: {message}")]
    Bad {
        /// Machine-readable response code, if present.
        code: Option<String>,
        /// Human-readable text from the response.
        message: String,
    },

    /// The DEFLATE codec or its worker failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// The connection is closed or was torn down mid-operation.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The requested operation is not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Protocol violation or unexpected data.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Returns true if this error tears the connection down.
    ///
    /// Server rejections of a single command are the only non-fatal errors.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::No { .. } | Self::Bad { .. })
    }

    /// Returns the response code attached to a server rejection, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::No { code, .. } | Self::Bad { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_server_rejections_are_not_fatal() {
        let no = Error::No {
            code: Some("AUTHENTICATIONFAILED".to_string()),
            message: "bad creds".to_string(),
        };
        let bad = Error::Bad {
            code: None,
            message: "Error".to_string(),
        };
        assert!(!no.is_fatal());
        assert!(!bad.is_fatal());
        assert!(Error::Timeout(Duration::from_secs(10)).is_fatal());
        assert!(Error::ConnectionClosed("gone".to_string()).is_fatal());
    }

    #[test]
    fn test_code_accessor() {
        let err = Error::No {
            code: Some("ALERT".to_string()),
            message: "watch out".to_string(),
        };
        assert_eq!(err.code(), Some("ALERT"));
        assert_eq!(Error::Compile("x".to_string()).code(), None);
    }

    #[test]
    fn test_display() {
        let err = Error::Parse {
            position: 7,
            message: "unterminated quoted string".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Parse error at position 7: unterminated quoted string"
        );
    }
}
