//! HTTP/2 errors and RFC 7540 error codes

use crate::xsocket;
use std::fmt;

/// HTTP/2 errors
///
/// Connection errors end the whole connection with GOAWAY. Stream errors
/// ([`Error::Stream`], [`Error::StreamClosed`], [`Error::RefusedStream`]) only
/// reset the stream they name.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] xsocket::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Flow control error: {0}")]
    FlowControl(String),

    #[error("Frame size error: {0}")]
    FrameSize(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Invalid settings value: {0}")]
    InvalidSettings(String),

    #[error("Missing connection preface")]
    MissingPreface,

    /// Stream-scoped failure carrying the code to reset it with
    #[error("Stream {stream_id} error: {code}")]
    Stream { stream_id: u32, code: ErrorCode },

    #[error("Stream closed: {0}")]
    StreamClosed(u32),

    #[error("Refused stream: {0}")]
    RefusedStream(u32),

    /// Sending more than the flow-control window allows
    #[error("Flow control window exceeded on stream {stream_id}: {requested} > {available}")]
    WindowExceeded {
        stream_id: u32,
        requested: usize,
        available: usize,
    },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The code a RST_STREAM or GOAWAY frame for this error carries
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Protocol(_) | Error::MissingPreface | Error::InvalidSettings(_) => {
                ErrorCode::ProtocolError
            }
            Error::FlowControl(_) => ErrorCode::FlowControlError,
            Error::FrameSize(_) => ErrorCode::FrameSizeError,
            Error::Compression(_) => ErrorCode::CompressionError,
            Error::Stream { code, .. } => *code,
            Error::StreamClosed(_) => ErrorCode::StreamClosed,
            Error::RefusedStream(_) => ErrorCode::RefusedStream,
            Error::Transport(_) | Error::ConnectionClosed => ErrorCode::NoError,
            Error::WindowExceeded { .. } | Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// The stream this error is confined to, if it is not a connection error
    pub fn stream_id(&self) -> Option<u32> {
        match self {
            Error::Stream { stream_id, .. }
            | Error::StreamClosed(stream_id)
            | Error::RefusedStream(stream_id) => Some(*stream_id),
            _ => None,
        }
    }
}

/// RFC 7540 Section 7 error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Unknown codes are treated as INTERNAL_ERROR (RFC 7540 Section 7)
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            _ => ErrorCode::InternalError,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(ErrorCode::RefusedStream.as_u32(), 0x7);
        assert_eq!(ErrorCode::from_u32(0x8), ErrorCode::Cancel);
        assert_eq!(ErrorCode::from_u32(0xff), ErrorCode::InternalError);
    }

    #[test]
    fn test_error_codes_for_frames() {
        assert_eq!(Error::FrameSize("big".into()).code(), ErrorCode::FrameSizeError);
        assert_eq!(Error::RefusedStream(3).code(), ErrorCode::RefusedStream);
        assert_eq!(Error::Transport(xsocket::Error::Closed).code(), ErrorCode::NoError);
    }

    #[test]
    fn test_stream_scoped_errors() {
        assert_eq!(Error::RefusedStream(5).stream_id(), Some(5));
        let err = Error::Stream {
            stream_id: 7,
            code: ErrorCode::ProtocolError,
        };
        assert_eq!(err.stream_id(), Some(7));
        assert_eq!(Error::Protocol("x".into()).stream_id(), None);
        assert_eq!(err.to_string(), "Stream 7 error: PROTOCOL_ERROR (0x1)");
    }
}
