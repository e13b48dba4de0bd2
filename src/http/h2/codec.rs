//! HTTP/2 frame encoding and incremental decoding

use super::error::{Error, Result};
use super::frames::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Frame encoder; every function returns one complete frame
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame header
    pub fn encode_header(
        frame_type: FrameType,
        flags: FrameFlags,
        stream_id: u32,
        length: usize,
    ) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;
        header[3] = frame_type.as_u8();
        header[4] = flags.as_u8();
        // Reserved bit stays clear
        header[5..9].copy_from_slice(&(stream_id & 0x7FFF_FFFF).to_be_bytes());
        header
    }

    /// Decode a frame header into (type byte, flags, stream id, payload length)
    ///
    /// The type is left raw so that unknown frame types can be skipped.
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> (u8, FrameFlags, u32, usize) {
        let length = ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);
        let stream_id = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) & 0x7FFF_FFFF;
        (bytes[3], FrameFlags::from_u8(bytes[4]), stream_id, length)
    }

    fn frame(frame_type: FrameType, flags: FrameFlags, stream_id: u32, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_slice(&Self::encode_header(frame_type, flags, stream_id, payload.len()));
        buf.put_slice(payload);
        buf.freeze()
    }

    pub fn encode_data_frame(frame: &DataFrame) -> Bytes {
        let flags = FrameFlags::empty().with(FrameFlags::END_STREAM, frame.end_stream);
        Self::frame(FrameType::Data, flags, frame.stream_id, &frame.data)
    }

    /// Encode a header block, split into HEADERS plus CONTINUATION frames so
    /// that no fragment exceeds `max_frame_size`
    pub fn encode_header_block(
        stream_id: u32,
        block: &[u8],
        end_stream: bool,
        max_frame_size: usize,
    ) -> Bytes {
        let max = max_frame_size.max(1);
        let mut buf = BytesMut::with_capacity(block.len() + FRAME_HEADER_SIZE);
        let mut fragments = block.chunks(max).peekable();
        let mut first = true;

        if fragments.peek().is_none() {
            let flags = FrameFlags::empty()
                .with(FrameFlags::END_STREAM, end_stream)
                .with(FrameFlags::END_HEADERS, true);
            buf.put_slice(&Self::encode_header(FrameType::Headers, flags, stream_id, 0));
            return buf.freeze();
        }

        while let Some(fragment) = fragments.next() {
            let last = fragments.peek().is_none();
            let (frame_type, flags) = if first {
                let flags = FrameFlags::empty()
                    .with(FrameFlags::END_STREAM, end_stream)
                    .with(FrameFlags::END_HEADERS, last);
                (FrameType::Headers, flags)
            } else {
                let flags = FrameFlags::empty().with(FrameFlags::END_HEADERS, last);
                (FrameType::Continuation, flags)
            };
            buf.put_slice(&Self::encode_header(frame_type, flags, stream_id, fragment.len()));
            buf.put_slice(fragment);
            first = false;
        }
        buf.freeze()
    }

    pub fn encode_headers_frame(frame: &HeadersFrame) -> Bytes {
        let flags = FrameFlags::empty()
            .with(FrameFlags::END_STREAM, frame.end_stream)
            .with(FrameFlags::END_HEADERS, frame.end_headers);
        Self::frame(FrameType::Headers, flags, frame.stream_id, &frame.header_block)
    }

    pub fn encode_settings_frame(frame: &SettingsFrame) -> Bytes {
        if frame.ack {
            return Self::frame(FrameType::Settings, FrameFlags::from_u8(FrameFlags::ACK), 0, &[]);
        }
        Self::frame(
            FrameType::Settings,
            FrameFlags::empty(),
            0,
            &frame.settings.encode_payload(),
        )
    }

    pub fn encode_ping_frame(frame: &PingFrame) -> Bytes {
        let flags = FrameFlags::empty().with(FrameFlags::ACK, frame.ack);
        Self::frame(FrameType::Ping, flags, 0, &frame.data)
    }

    pub fn encode_goaway_frame(frame: &GoawayFrame) -> Bytes {
        let mut payload = BytesMut::with_capacity(8 + frame.debug_data.len());
        payload.put_u32(frame.last_stream_id & 0x7FFF_FFFF);
        payload.put_u32(frame.error_code.as_u32());
        payload.put_slice(&frame.debug_data);
        Self::frame(FrameType::Goaway, FrameFlags::empty(), 0, &payload)
    }

    pub fn encode_window_update_frame(frame: &WindowUpdateFrame) -> Bytes {
        let increment = (frame.size_increment & 0x7FFF_FFFF).to_be_bytes();
        Self::frame(FrameType::WindowUpdate, FrameFlags::empty(), frame.stream_id, &increment)
    }

    pub fn encode_rst_stream_frame(frame: &RstStreamFrame) -> Bytes {
        let code = frame.error_code.as_u32().to_be_bytes();
        Self::frame(FrameType::RstStream, FrameFlags::empty(), frame.stream_id, &code)
    }
}

/// Incremental frame decoder
///
/// Bytes are fed as they arrive from the socket; complete frames come out of
/// [`FrameDecoder::next_frame`]. Frames of unknown type are dropped.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        FrameDecoder {
            buf: BytesMut::with_capacity(16 * 1024),
            max_frame_size,
        }
    }

    /// Raise the accepted payload size once our SETTINGS are in effect
    pub fn set_max_frame_size(&mut self, size: usize) {
        self.max_frame_size = size;
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take buffered bytes without decoding them
    pub fn take_buffered(&mut self, n: usize) -> Bytes {
        self.buf.split_to(n.min(self.buf.len())).freeze()
    }

    pub fn peek(&self) -> &[u8] {
        &self.buf
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if self.buf.len() < FRAME_HEADER_SIZE {
                return Ok(None);
            }
            let mut header = [0u8; FRAME_HEADER_SIZE];
            header.copy_from_slice(&self.buf[..FRAME_HEADER_SIZE]);
            let (kind, flags, stream_id, length) = FrameCodec::decode_header(&header);

            if length > self.max_frame_size {
                return Err(Error::FrameSize(format!(
                    "frame of {} bytes exceeds limit {}",
                    length, self.max_frame_size
                )));
            }
            if self.buf.len() < FRAME_HEADER_SIZE + length {
                return Ok(None);
            }

            self.buf.advance(FRAME_HEADER_SIZE);
            let payload = self.buf.split_to(length).freeze();

            match FrameType::from_u8(kind) {
                Some(frame_type) => {
                    return Ok(Some(Frame::new(frame_type, flags, stream_id, payload)));
                }
                None => tracing::trace!(kind, stream_id, length, "skipping unknown frame type"),
            }
        }
    }
}
