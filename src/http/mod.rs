//! HTTP/1.1 and HTTP/2 protocol layer
//!
//! # Architecture
//!
//! Everything protocol-shaped is sans-io and sits on top of the transport
//! sockets in [`crate::xsocket`]:
//!
//! - [`framing`] turns a byte stream into complete requests (chunked,
//!   Content-Length, or the stream-timeout fallback) with blocking and event
//!   loop drivers over [`SessionOps`](crate::xsocket::SessionOps) and
//!   [`AsyncSessionOps`](crate::xsocket::AsyncSessionOps)
//! - [`writer`] serializes a [`Response`] back onto the socket
//! - [`h2`] holds the HTTP/2 frame layer, the connection state machine and the
//!   per-connection stream engine
//!
//! # Examples
//!
//! ```
//! use xserve::http::framing::{Progress, RequestAccumulator};
//!
//! let mut acc = RequestAccumulator::new(8192);
//! let progress = acc
//!     .feed(b"POST /upload HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello")
//!     .unwrap();
//! assert_eq!(progress, Progress::Complete);
//!
//! let (request, leftover) = acc.into_request().unwrap();
//! assert_eq!(request.body(), &b"hello"[..]);
//! assert!(leftover.is_empty());
//! ```

pub mod chunked;
pub mod framing;
pub mod h2;
pub mod headers;
pub mod message;
pub mod parser;
pub mod writer;

pub use framing::{read_full_request, read_full_request_async, FramingOptions, FramingStrategy};
pub use headers::Headers;
pub use message::{Body, ChunkStream, RangeSource, Request, RequestStore, Response, Method, Status, Version};
pub use writer::{write_response, write_response_async};

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::xsocket::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid HTTP status: {0}")]
    InvalidStatus(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Request head exceeds {0} bytes")]
    HeadersTooLarge(usize),

    #[error("Incomplete message")]
    Incomplete,

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Whether this error is ordinary client churn (reset, timeout, closed)
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Timeout | Error::ConnectionClosed => true,
            Error::Transport(err) => err.is_transport(),
            Error::Io(err) => crate::xsocket::Error::from_io(std::io::Error::from(err.kind()))
                .is_transport(),
            _ => false,
        }
    }

    /// Whether the client sent something unparseable (answered with 400)
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Error::Parse(_)
                | Error::InvalidVersion(_)
                | Error::InvalidMethod(_)
                | Error::InvalidHeader(_)
                | Error::InvalidChunkSize(_)
                | Error::HeadersTooLarge(_)
                | Error::Protocol(_)
        )
    }
}

/// Maximum number of headers per message
pub const MAX_HEADERS: usize = 100;

/// CRLF line ending
pub const CRLF: &str = "\r\n";
