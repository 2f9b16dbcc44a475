//! Common error types used throughout mediaferry.
//!
//! Covers the failure cases shared by range sources, registries and
//! channels: missing resources, bad input, I/O, timeouts and closed
//! message channels.

/// Common error type for mediaferry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested resource or session was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation did not finish in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The other end of a message channel went away.
    #[error("Channel closed: {0}")]
    Closed(&'static str),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new NotFound error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new InvalidInput error.
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new Timeout error.
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new Internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a new Io error from a message (for network failures, etc).
    pub fn io<S: Into<String>>(msg: S) -> Self {
        Self::Io(std::io::Error::other(msg.into()))
    }
}

/// Result type alias using the common Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::not_found("stream abc");
        assert_eq!(err.to_string(), "Not found: stream abc");

        let err = Error::invalid_input("bad range");
        assert_eq!(err.to_string(), "Invalid input: bad range");

        let err = Error::timeout("range 0-4096");
        assert_eq!(err.to_string(), "Timed out: range 0-4096");

        let err = Error::Closed("worker");
        assert_eq!(err.to_string(), "Channel closed: worker");

        let err = Error::internal("unexpected state");
        assert_eq!(err.to_string(), "Internal error: unexpected state");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));

        let err = Error::io("connection reset");
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("connection reset"));
    }
}
