//! Transport socket layer
//!
//! One narrow interface over plain TCP and TLS connections, in two flavours:
//!
//! - [`XSocket`] is the blocking socket used by worker threads and processes.
//!   It implements [`SessionOps`] (poll, read, write, close) with per-call
//!   timeouts.
//! - [`AsyncXSocket`] suspends on I/O and is used on the event loop. It
//!   implements [`AsyncSessionOps`].
//!
//! # TLS
//!
//! The OpenSSL engine never owns the OS socket. It reads and writes an in-memory
//! ciphertext buffer pair ([`MemoryBio`]), and the socket types shuttle bytes
//! between that buffer and the network:
//!
//! - writing pushes plaintext into the engine and flushes the resulting
//!   ciphertext to the socket
//! - reading feeds ciphertext from the socket into the engine and pulls
//!   decrypted plaintext out
//! - the handshake alternates between the two on "want read" / "want write"
//!   until it completes or the caller's timeout expires
//!
//! Because the engine is transport-agnostic, a connection whose handshake ran
//! in blocking mode can be handed to the event loop with [`XSocket::into_async`].
//!
//! # Blocking calls on the event loop
//!
//! Threads that drive the event loop mark themselves with [`event_loop::enter`].
//! Every blocking socket operation checks that mark and fails with
//! [`Error::BlockingOnEventLoop`] instead of stalling every connection on the
//! loop.

pub mod blocking;
pub mod buffer;
pub mod builtin_cert;
pub mod event_loop;
pub mod nonblocking;
pub mod tls;

pub use blocking::{PollEvents, SessionOps, XSocket};
pub use buffer::MemoryBio;
pub use event_loop::{ensure_blocking_allowed, EventLoopGuard};
pub use nonblocking::{AsyncSessionOps, AsyncXSocket};
pub use tls::{HandshakeStatus, PlainRead, TlsConfig, TlsEngine, TlsVersion};

use std::io;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("Timeout")]
    Timeout,

    #[error("Connection reset by peer")]
    ConnectionReset,

    #[error("Connection closed")]
    Closed,

    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    /// TLS failure caused by the server side (engine state, certificates)
    #[error("TLS error: {0}")]
    Tls(String),

    /// TLS failure caused by a misbehaving or misconfigured client, such as
    /// plain HTTP sent to a TLS port
    #[error("TLS protocol error: {0}")]
    TlsProtocol(String),

    #[error("Invalid TLS version: {0}")]
    InvalidTlsVersion(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Plaintext I/O attempted before the TLS handshake completed")]
    HandshakeIncomplete,

    #[error("Blocking socket operation attempted on an event loop thread")]
    BlockingOnEventLoop,
}

impl Error {
    /// Map an I/O error onto the transport taxonomy
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Error::ConnectionReset,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
            io::ErrorKind::UnexpectedEof => Error::Closed,
            _ => Error::Io(err),
        }
    }

    /// Whether this error is ordinary client churn rather than a server fault
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Timeout | Error::ConnectionReset | Error::Closed => true,
            Error::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::NotConnected | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Whether this error is a TLS mistake made by the client
    pub fn is_client_tls_mistake(&self) -> bool {
        matches!(self, Error::TlsProtocol(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::from_io(err)
    }
}

/// Log a transport error at the severity its class deserves
///
/// Churn and client TLS mistakes are routine; anything else is worth a warning.
/// `suppress` silences the routine classes entirely.
pub fn log_error(context: &str, err: &Error, suppress: bool) {
    if err.is_transport() {
        if !suppress {
            tracing::debug!(error = %err, "{}", context);
        }
    } else if err.is_client_tls_mistake() {
        if !suppress {
            tracing::info!(error = %err, "{}", context);
        }
    } else {
        tracing::warn!(error = %err, "{}", context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        let reset = Error::from_io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(reset, Error::ConnectionReset));
        assert!(reset.is_transport());

        let pipe = Error::from_io(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(pipe, Error::ConnectionReset));

        let timeout = Error::from_io(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(matches!(timeout, Error::Timeout));

        let other = Error::from_io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(other, Error::Io(_)));
        assert!(!other.is_transport());
    }

    #[test]
    fn test_timeout_distinct_from_reset() {
        assert_ne!(Error::Timeout.to_string(), Error::ConnectionReset.to_string());
    }

    #[test]
    fn test_tls_protocol_errors_are_client_mistakes() {
        let err = Error::TlsProtocol("http request".to_string());
        assert!(err.is_client_tls_mistake());
        assert!(!err.is_transport());
        assert!(!Error::Tls("engine".to_string()).is_client_tls_mistake());
    }
}
