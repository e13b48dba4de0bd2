//! WebSocket protocol (RFC 6455) with permessage-deflate (RFC 7692)
//!
//! - [`handshake`] validates the HTTP upgrade and builds the 101 response
//! - [`frame`] is the sans-io frame codec
//! - [`deflate`] compresses and inflates message payloads
//! - [`session`] runs an upgraded connection: the receive loop, the heartbeat
//!   and one task per dispatched message
//!
//! Handshake failures are answered with ordinary HTTP responses. Once the
//! connection is upgraded, every failure ends in a close frame carrying a
//! [`CloseCode`].

pub mod deflate;
pub mod frame;
pub mod handshake;
pub mod session;

pub use deflate::{negotiate_deflate, DeflateParams, PerMessageDeflate};
pub use frame::{Frame, FrameCodec, OpCode};
pub use handshake::{accept_key, validate_upgrade, HandshakeError, Upgrade};
pub use session::{SessionConfig, WebSocketSession, WsHandle};

use bytes::Bytes;
use std::fmt;

/// Result type for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] crate::xsocket::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(u64),

    #[error("Message of {0} bytes exceeds the limit")]
    MessageTooLarge(usize),

    #[error("Invalid UTF-8 in text message")]
    InvalidUtf8,

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("No pong after {0} pings")]
    HeartbeatTimeout(u32),

    #[error("Session closed")]
    Closed,
}

impl Error {
    /// Close code sent to the peer when this error ends the session
    pub fn close_code(&self) -> CloseCode {
        match self {
            Error::Protocol(_) => CloseCode::ProtocolError,
            Error::FrameTooLarge(_) | Error::MessageTooLarge(_) => CloseCode::MessageTooBig,
            Error::InvalidUtf8 | Error::Compression(_) => CloseCode::InvalidPayload,
            Error::HeartbeatTimeout(_) => CloseCode::GoingAway,
            Error::Transport(_) => CloseCode::Abnormal,
            Error::Closed => CloseCode::Normal,
        }
    }
}

/// Close status codes (RFC 6455 Section 7.4.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    GoingAway,
    ProtocolError,
    Unsupported,
    /// Never sent on the wire; reported when the peer's close had no code
    NoStatus,
    /// Never sent on the wire; reported when the connection dropped
    Abnormal,
    InvalidPayload,
    PolicyViolation,
    MessageTooBig,
    MandatoryExtension,
    InternalError,
    /// Registered (3000-3999) or private (4000-4999) codes
    Other(u16),
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::MandatoryExtension => 1010,
            CloseCode::InternalError => 1011,
            CloseCode::Other(code) => code,
        }
    }

    pub fn from_u16(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::NoStatus,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooBig,
            1010 => CloseCode::MandatoryExtension,
            1011 => CloseCode::InternalError,
            other => CloseCode::Other(other),
        }
    }

    /// Whether a peer may send this code in a close frame
    pub fn is_sendable(self) -> bool {
        matches!(self.as_u16(), 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// A complete, reassembled message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

impl Message {
    pub fn len(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
        }
    }
}
