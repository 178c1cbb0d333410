//! Error types shared by every nexio transport.

use std::io;

use thiserror::Error;

/// A specialized `Result` type for nexio operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents errors that can occur across the framework.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The reactor service is not started.
    #[error("service is not started")]
    ServiceNotStarted,

    /// The endpoint is not connected.
    #[error("endpoint is not connected")]
    NotConnected,

    /// Failed to establish a connection.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The TLS or WebSocket handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The endpoint was configured with invalid parameters.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A protocol-level error occurred (HTTP framing, WebSocket framing).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The operation did not complete within the specified timeout.
    #[error("operation timed out")]
    Timeout,

    /// Pending send bytes would exceed the configured limit.
    #[error("send buffer limit exceeded ({pending} > {limit} bytes)")]
    SendBufferLimit {
        /// Bytes that would be pending after the rejected append.
        pending: usize,
        /// The configured limit.
        limit: usize,
    },

    /// The receive buffer would grow past the configured limit.
    #[error("receive buffer limit exceeded (limit {limit} bytes)")]
    ReceiveBufferLimit {
        /// The configured limit.
        limit: usize,
    },

    /// An underlying I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error signifies normal connection teardown and should be
    /// suppressed from error callbacks.
    pub fn is_benign(&self) -> bool {
        match self {
            Self::Io(e) => is_benign_disconnect(e),
            _ => false,
        }
    }
}

/// Classifies an I/O error as a benign disconnect: the peer went away in one
/// of the ways that signify normal teardown rather than a fault.
pub fn is_benign_disconnect(error: &io::Error) -> bool {
    // Windows reports cancelled overlapped I/O as code 995.
    if error.raw_os_error() == Some(995) {
        return true;
    }
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Classifies an I/O error coming out of a TLS stream as benign. Extends the
/// plain-TCP list with the rustls shutdown races that occur when a peer
/// closes the socket without a proper `close_notify` exchange.
pub fn is_benign_tls_disconnect(error: &io::Error) -> bool {
    if is_benign_disconnect(error) {
        return true;
    }
    let message = error.to_string();
    const BENIGN: [&str; 4] = [
        "close_notify",
        "decryption failed or bad record mac",
        "protocol is shutdown",
        "wrong version number",
    ];
    BENIGN
        .iter()
        .any(|needle| message.to_ascii_lowercase().contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_disconnects() {
        assert!(is_benign_disconnect(&io::Error::from(
            io::ErrorKind::ConnectionReset
        )));
        assert!(is_benign_disconnect(&io::Error::from(
            io::ErrorKind::UnexpectedEof
        )));
        assert!(!is_benign_disconnect(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
    }

    #[test]
    fn test_benign_tls_disconnects() {
        let err = io::Error::other("peer closed connection without sending TLS close_notify");
        assert!(is_benign_tls_disconnect(&err));
        let err = io::Error::other("invalid certificate");
        assert!(!is_benign_tls_disconnect(&err));
    }

    #[test]
    fn test_error_is_benign() {
        let err = Error::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(err.is_benign());
        assert!(!Error::Timeout.is_benign());
    }
}
