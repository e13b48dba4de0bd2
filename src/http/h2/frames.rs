//! HTTP/2 frame types (RFC 7540 Section 6)
//!
//! [`Frame`] is the raw unit the codec produces. The typed frames below are
//! parsed out of it on demand, which is where padding and the fixed-size
//! payload checks are handled.

use super::error::{Error, ErrorCode, Result};
use super::settings::Settings;
use super::CONNECTION_STREAM_ID;
use bytes::Bytes;
use std::fmt;

/// Frame type codes (RFC 7540 Section 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// DATA (0x0) - request or response body bytes, flow controlled
    Data = 0x0,
    /// HEADERS (0x1) - opens a stream with the first header block fragment
    Headers = 0x1,
    /// PRIORITY (0x2) - stream dependency and weight; parsed and ignored
    Priority = 0x2,
    /// RST_STREAM (0x3) - ends one stream with an error code
    RstStream = 0x3,
    /// SETTINGS (0x4) - connection parameters, acknowledged by the peer
    Settings = 0x4,
    /// PUSH_PROMISE (0x5) - server push; never sent, refused from clients
    PushPromise = 0x5,
    /// PING (0x6) - liveness probe echoed with ACK
    Ping = 0x6,
    /// GOAWAY (0x7) - last accepted stream before the connection closes
    Goaway = 0x7,
    /// WINDOW_UPDATE (0x8) - grants more flow-control credit
    WindowUpdate = 0x8,
    /// CONTINUATION (0x9) - further header block fragments
    Continuation = 0x9,
}

impl FrameType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Unknown types return `None` and must be ignored (RFC 7540 Section 4.1)
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Headers),
            0x2 => Some(FrameType::Priority),
            0x3 => Some(FrameType::RstStream),
            0x4 => Some(FrameType::Settings),
            0x5 => Some(FrameType::PushPromise),
            0x6 => Some(FrameType::Ping),
            0x7 => Some(FrameType::Goaway),
            0x8 => Some(FrameType::WindowUpdate),
            0x9 => Some(FrameType::Continuation),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::Headers => "HEADERS",
            FrameType::Priority => "PRIORITY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings => "SETTINGS",
            FrameType::PushPromise => "PUSH_PROMISE",
            FrameType::Ping => "PING",
            FrameType::Goaway => "GOAWAY",
            FrameType::WindowUpdate => "WINDOW_UPDATE",
            FrameType::Continuation => "CONTINUATION",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Frame flag bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// END_STREAM (0x1) - last frame the sender puts on this stream
    pub const END_STREAM: u8 = 0x1;
    /// ACK (0x1) - shares its bit with END_STREAM; used by SETTINGS and PING
    pub const ACK: u8 = 0x1;
    /// END_HEADERS (0x4) - the header block is complete
    pub const END_HEADERS: u8 = 0x4;
    /// PADDED (0x8) - a pad length byte leads the payload
    pub const PADDED: u8 = 0x8;
    /// PRIORITY (0x20) - HEADERS carries a priority block
    pub const PRIORITY: u8 = 0x20;

    pub fn empty() -> Self {
        FrameFlags(0)
    }

    pub fn from_u8(flags: u8) -> Self {
        FrameFlags(flags)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    pub fn with(mut self, flag: u8, on: bool) -> Self {
        if on {
            self.set(flag);
        }
        self
    }

    pub fn is_set(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    pub fn is_end_stream(&self) -> bool {
        self.is_set(Self::END_STREAM)
    }

    pub fn is_ack(&self) -> bool {
        self.is_set(Self::ACK)
    }

    pub fn is_end_headers(&self) -> bool {
        self.is_set(Self::END_HEADERS)
    }

    pub fn is_padded(&self) -> bool {
        self.is_set(Self::PADDED)
    }

    pub fn is_priority(&self) -> bool {
        self.is_set(Self::PRIORITY)
    }
}

/// A decoded frame with its payload still raw
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, flags: FrameFlags, stream_id: u32, payload: Bytes) -> Self {
        Frame {
            frame_type,
            flags,
            stream_id,
            payload,
        }
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    fn require_stream(&self) -> Result<()> {
        if self.stream_id == CONNECTION_STREAM_ID {
            return Err(Error::Protocol(format!("{} frame on stream 0", self.frame_type)));
        }
        Ok(())
    }

    fn require_connection(&self) -> Result<()> {
        if self.stream_id != CONNECTION_STREAM_ID {
            return Err(Error::Protocol(format!(
                "{} frame on stream {}",
                self.frame_type, self.stream_id
            )));
        }
        Ok(())
    }

    fn require_len(&self, len: usize) -> Result<()> {
        if self.payload.len() != len {
            return Err(Error::FrameSize(format!(
                "{} payload is {} bytes, expected {}",
                self.frame_type,
                self.payload.len(),
                len
            )));
        }
        Ok(())
    }
}

/// Split off the padding of a PADDED frame
fn strip_padding(frame: &Frame) -> Result<Bytes> {
    if !frame.flags.is_padded() {
        return Ok(frame.payload.clone());
    }
    let Some(&pad_len) = frame.payload.first() else {
        return Err(Error::FrameSize("PADDED frame without pad length".to_string()));
    };
    let pad_len = pad_len as usize;
    if pad_len >= frame.payload.len() {
        return Err(Error::Protocol(format!(
            "padding {} exceeds {} frame payload",
            pad_len, frame.frame_type
        )));
    }
    Ok(frame.payload.slice(1..frame.payload.len() - pad_len))
}

/// DATA frame (RFC 7540 Section 6.1)
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub stream_id: u32,
    pub data: Bytes,
    pub end_stream: bool,
    /// The whole payload length, padding included, which is what flow control counts
    pub flow_controlled_len: usize,
}

impl DataFrame {
    pub fn new(stream_id: u32, data: Bytes, end_stream: bool) -> Self {
        let flow_controlled_len = data.len();
        DataFrame {
            stream_id,
            data,
            end_stream,
            flow_controlled_len,
        }
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        frame.require_stream()?;
        let data = strip_padding(frame)?;
        Ok(DataFrame {
            stream_id: frame.stream_id,
            data,
            end_stream: frame.flags.is_end_stream(),
            flow_controlled_len: frame.payload.len(),
        })
    }
}

/// Stream dependency carried by HEADERS and PRIORITY frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    pub stream_dependency: u32,
    pub exclusive: bool,
    pub weight: u8,
}

impl PrioritySpec {
    fn parse(bytes: &[u8]) -> Self {
        let dep = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        PrioritySpec {
            stream_dependency: dep & 0x7FFF_FFFF,
            exclusive: dep & 0x8000_0000 != 0,
            weight: bytes[4],
        }
    }
}

/// HEADERS frame (RFC 7540 Section 6.2)
#[derive(Debug, Clone)]
pub struct HeadersFrame {
    pub stream_id: u32,
    /// Header block fragment; CONTINUATION frames may follow
    pub header_block: Bytes,
    pub end_stream: bool,
    pub end_headers: bool,
    pub priority: Option<PrioritySpec>,
}

impl HeadersFrame {
    pub fn new(stream_id: u32, header_block: Bytes, end_stream: bool, end_headers: bool) -> Self {
        HeadersFrame {
            stream_id,
            header_block,
            end_stream,
            end_headers,
            priority: None,
        }
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        frame.require_stream()?;
        let mut block = strip_padding(frame)?;
        let priority = if frame.flags.is_priority() {
            if block.len() < 5 {
                return Err(Error::FrameSize("HEADERS priority block truncated".to_string()));
            }
            let spec = PrioritySpec::parse(&block[..5]);
            block = block.slice(5..);
            if spec.stream_dependency == frame.stream_id {
                return Err(Error::Stream {
                    stream_id: frame.stream_id,
                    code: ErrorCode::ProtocolError,
                });
            }
            Some(spec)
        } else {
            None
        };

        Ok(HeadersFrame {
            stream_id: frame.stream_id,
            header_block: block,
            end_stream: frame.flags.is_end_stream(),
            end_headers: frame.flags.is_end_headers(),
            priority,
        })
    }
}

/// PRIORITY frame (RFC 7540 Section 6.3); accepted and otherwise ignored
pub fn check_priority_frame(frame: &Frame) -> Result<PrioritySpec> {
    frame.require_stream()?;
    if frame.payload.len() != 5 {
        return Err(Error::Stream {
            stream_id: frame.stream_id,
            code: ErrorCode::FrameSizeError,
        });
    }
    Ok(PrioritySpec::parse(&frame.payload))
}

/// RST_STREAM frame (RFC 7540 Section 6.4)
#[derive(Debug, Clone, Copy)]
pub struct RstStreamFrame {
    pub stream_id: u32,
    pub error_code: ErrorCode,
}

impl RstStreamFrame {
    pub fn parse(frame: &Frame) -> Result<Self> {
        frame.require_stream()?;
        frame.require_len(4)?;
        let p = &frame.payload;
        Ok(RstStreamFrame {
            stream_id: frame.stream_id,
            error_code: ErrorCode::from_u32(u32::from_be_bytes([p[0], p[1], p[2], p[3]])),
        })
    }
}

/// SETTINGS frame (RFC 7540 Section 6.5)
#[derive(Debug, Clone)]
pub struct SettingsFrame {
    pub ack: bool,
    pub settings: Settings,
}

impl SettingsFrame {
    pub fn new(settings: Settings) -> Self {
        SettingsFrame {
            ack: false,
            settings,
        }
    }

    pub fn ack() -> Self {
        SettingsFrame {
            ack: true,
            settings: Settings::default(),
        }
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        frame.require_connection()?;
        if frame.flags.is_ack() {
            if !frame.payload.is_empty() {
                return Err(Error::FrameSize("SETTINGS ACK with payload".to_string()));
            }
            return Ok(SettingsFrame::ack());
        }
        Ok(SettingsFrame::new(Settings::decode_payload(&frame.payload)?))
    }
}

/// PING frame (RFC 7540 Section 6.7)
#[derive(Debug, Clone, Copy)]
pub struct PingFrame {
    pub ack: bool,
    pub data: [u8; 8],
}

impl PingFrame {
    pub fn new(data: [u8; 8]) -> Self {
        PingFrame { ack: false, data }
    }

    /// The reply to a PING carries the same opaque data
    pub fn ack(data: [u8; 8]) -> Self {
        PingFrame { ack: true, data }
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        frame.require_connection()?;
        frame.require_len(8)?;
        let mut data = [0u8; 8];
        data.copy_from_slice(&frame.payload);
        Ok(PingFrame {
            ack: frame.flags.is_ack(),
            data,
        })
    }
}

/// GOAWAY frame (RFC 7540 Section 6.8)
#[derive(Debug, Clone)]
pub struct GoawayFrame {
    pub last_stream_id: u32,
    pub error_code: ErrorCode,
    pub debug_data: Bytes,
}

impl GoawayFrame {
    pub fn new(last_stream_id: u32, error_code: ErrorCode, debug_data: Bytes) -> Self {
        GoawayFrame {
            last_stream_id,
            error_code,
            debug_data,
        }
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        frame.require_connection()?;
        if frame.payload.len() < 8 {
            return Err(Error::FrameSize("GOAWAY payload shorter than 8 bytes".to_string()));
        }
        let p = &frame.payload;
        Ok(GoawayFrame {
            last_stream_id: u32::from_be_bytes([p[0], p[1], p[2], p[3]]) & 0x7FFF_FFFF,
            error_code: ErrorCode::from_u32(u32::from_be_bytes([p[4], p[5], p[6], p[7]])),
            debug_data: frame.payload.slice(8..),
        })
    }
}

/// WINDOW_UPDATE frame (RFC 7540 Section 6.9)
#[derive(Debug, Clone, Copy)]
pub struct WindowUpdateFrame {
    /// 0 for the connection window
    pub stream_id: u32,
    pub size_increment: u32,
}

impl WindowUpdateFrame {
    pub fn new(stream_id: u32, size_increment: u32) -> Self {
        WindowUpdateFrame {
            stream_id,
            size_increment,
        }
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        frame.require_len(4)?;
        let p = &frame.payload;
        let increment = u32::from_be_bytes([p[0], p[1], p[2], p[3]]) & 0x7FFF_FFFF;
        if increment == 0 {
            return Err(if frame.stream_id == CONNECTION_STREAM_ID {
                Error::Protocol("WINDOW_UPDATE with zero increment".to_string())
            } else {
                Error::Stream {
                    stream_id: frame.stream_id,
                    code: ErrorCode::ProtocolError,
                }
            });
        }
        Ok(WindowUpdateFrame::new(frame.stream_id, increment))
    }
}
